//! Print the DCops CRD manifests as YAML
//!
//! `cargo run -p crds --bin crdgen > config/crd/maasmachines.yaml`

use crds::MaasMachine;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&MaasMachine::crd())?);
    Ok(())
}
