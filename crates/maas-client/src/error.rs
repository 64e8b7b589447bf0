//! MAAS client errors
//!
//! MAAS reports most failures as free text. [`classify_api_error`] is the only
//! place that inspects that text; everything above this crate matches on the
//! typed variants instead.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// VM host side resource that a compose request referenced but could not use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmHostResource {
    /// LXD profile
    Profile,
    /// LXD project
    Project,
    /// Storage pool
    Storage,
}

impl std::fmt::Display for VmHostResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmHostResource::Profile => write!(f, "profile"),
            VmHostResource::Project => write!(f, "project"),
            VmHostResource::Storage => write!(f, "storage"),
        }
    }
}

/// Errors that can occur when interacting with the MAAS API
#[derive(Debug, Error)]
pub enum MaasError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// MAAS API returned an error that has no more specific meaning
    #[error("MAAS API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication failed (malformed or revoked API key)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g., missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Another node already uses the requested hostname
    #[error("Hostname already in use: {0}")]
    HostnameInUse(String),

    /// The VM host cannot attach the requested networks
    #[error("Requested networks not available on VM host: {0}")]
    NetworkMismatch(String),

    /// No machine or VM host capacity matches the constraints
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// An operation drove a machine into the Broken state
    #[error("Machine {} is broken: {message}", .system_id.as_deref().unwrap_or("<unnamed>"))]
    BrokenMachine {
        /// System id named in the failure, when MAAS reported one
        system_id: Option<String>,
        /// VM host named in the failure, when MAAS reported one
        host_id: Option<String>,
        message: String,
    },

    /// The machine's lifecycle state does not allow the operation
    #[error("Invalid machine state: {0}")]
    InvalidState(String),

    /// A profile, project or storage pool on the VM host is missing or unusable
    #[error("VM host {resource} error: {message}")]
    VmHostResource {
        resource: VmHostResource,
        message: String,
    },
}

impl MaasError {
    /// True when the error means the addressed object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, MaasError::NotFound(_))
    }
}

static HOSTNAME_IN_USE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)hostname\b.*\balready (exists|in use)|already (exists|in use)\b.*\bhostname")
        .expect("valid regex")
});

static NETWORK_MISMATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)unable to (match|find)\b.*\b(interface|network|subnet|space)|(network|subnet|space)\b.*\bnot (available|accessible|reachable)",
    )
    .expect("valid regex")
});

static BROKEN_MACHINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:machine|node|vm)\b[^\n]*\bbroken\b").expect("valid regex")
});

/// Candidate system ids: the `system_id` field, or the word after machine/node/vm
static SYSTEM_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)"system_id"\s*:\s*"([a-z0-9]{6})"|\b(?:machine|node|vm)\s+['"]?([a-z0-9]{6})\b"#,
    )
    .expect("valid regex")
});

static VM_HOST_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:vm[ -]?host|pod)\s+(?:id\s+)?(\d+)\b").expect("valid regex")
});

static PROFILE_MISSING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bprofile\b.*\bnot found\b").expect("valid regex"));

static PROJECT_MISSING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bproject\b.*\bnot found\b").expect("valid regex"));

static STORAGE_POOL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bstorage pool\b|\bstorage\b.*\b(not found|invalid)\b").expect("valid regex")
});

static INSUFFICIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)no (available )?machine (with|matches|matching)|insufficient|not enough (cores|memory|storage|resources|capacity)",
    )
    .expect("valid regex")
});

/// First token shaped like a MAAS system id. Those always carry a digit,
/// which keeps words such as "status" in "machine status is broken" out.
fn system_id_in(body: &str) -> Option<String> {
    SYSTEM_ID
        .captures_iter(body)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str())
        .find(|token| token.chars().any(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

/// Translate a non-success MAAS response into a typed error.
///
/// `context` names the operation (e.g. "POST /machines/?op=allocate") and is
/// kept in the message of untyped errors.
pub fn classify_api_error(status: u16, body: &str, context: &str) -> MaasError {
    let message = format!("{context}: {status} - {body}");

    if status == 401 || status == 403 {
        return MaasError::Authentication(message);
    }
    if status == 404 {
        return MaasError::NotFound(message);
    }

    if BROKEN_MACHINE.is_match(body) {
        let system_id = system_id_in(body);
        let host_id = VM_HOST_ID.captures(body).map(|c| c[1].to_string());
        return MaasError::BrokenMachine {
            system_id,
            host_id,
            message,
        };
    }
    if HOSTNAME_IN_USE.is_match(body) {
        return MaasError::HostnameInUse(message);
    }
    if PROFILE_MISSING.is_match(body) {
        return MaasError::VmHostResource {
            resource: VmHostResource::Profile,
            message,
        };
    }
    if PROJECT_MISSING.is_match(body) {
        return MaasError::VmHostResource {
            resource: VmHostResource::Project,
            message,
        };
    }
    if STORAGE_POOL.is_match(body) {
        return MaasError::VmHostResource {
            resource: VmHostResource::Storage,
            message,
        };
    }
    if NETWORK_MISMATCH.is_match(body) {
        return MaasError::NetworkMismatch(message);
    }
    if INSUFFICIENT.is_match(body) {
        return MaasError::InsufficientResources(message);
    }

    match status {
        400 => MaasError::InvalidRequest(message),
        409 => MaasError::InvalidState(message),
        _ => MaasError::Api(message),
    }
}
