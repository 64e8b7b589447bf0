//! Tag operations for MockMaasClient

use super::MockMaasClient;
use crate::error::MaasError;
use crate::models::*;

pub async fn create_tag(client: &MockMaasClient, name: &str) -> Result<Tag, MaasError> {
    Ok(client
        .tags
        .lock()
        .unwrap()
        .entry(name.to_string())
        .or_insert_with(|| Tag {
            name: name.to_string(),
            comment: String::new(),
        })
        .clone())
}

pub async fn assign_tag(client: &MockMaasClient, name: &str, system_id: &str) -> Result<(), MaasError> {
    if !client.tags.lock().unwrap().contains_key(name) {
        return Err(MaasError::NotFound(format!("No Tag matches the given query: {}", name)));
    }
    let mut machines = client.machines.lock().unwrap();
    let machine = machines.get_mut(system_id).ok_or_else(|| {
        MaasError::NotFound(format!("No Machine matches the given query: {}", system_id))
    })?;
    if !machine.tag_names.iter().any(|t| t == name) {
        machine.tag_names.push(name.to_string());
    }
    client.count(|c| c.tag += 1);
    Ok(())
}
