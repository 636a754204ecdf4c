use std::collections::BTreeMap;

/// Send notifications for publishes that came from a schedule.
pub const EMAILS_FOR_SCHEDULED_PUBLISHES: &str = "emails-for-scheduled-publishes";
/// Send notifications for publishes an editor triggered directly.
pub const EMAILS_FOR_PUBLISHES: &str = "emails-for-publishes";

pub trait FeatureFlags: Send + Sync {
    fn is_on(&self, key: &str) -> bool;
}

/// Flags from the `flags` config section. An environment variable
/// `SITE_PUBLISHER_FLAG_<KEY>` (key upper-cased, `-` as `_`) overrides the
/// configured value and is read on every call.
#[derive(Debug, Clone, Default)]
pub struct ConfigFlags {
    flags: BTreeMap<String, bool>,
}

impl ConfigFlags {
    pub fn new(flags: BTreeMap<String, bool>) -> Self {
        Self { flags }
    }

    fn env_key(key: &str) -> String {
        format!(
            "SITE_PUBLISHER_FLAG_{}",
            key.to_ascii_uppercase().replace('-', "_")
        )
    }
}

impl FeatureFlags for ConfigFlags {
    fn is_on(&self, key: &str) -> bool {
        if let Ok(value) = std::env::var(Self::env_key(key)) {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => return true,
                "0" | "false" | "off" | "no" => return false,
                _ => {}
            }
        }
        self.flags.get(key).copied().unwrap_or(false)
    }
}
