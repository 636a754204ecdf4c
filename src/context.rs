use std::sync::Arc;

use crate::build::BuildService;
use crate::db::Pool;
use crate::flags::FeatureFlags;
use crate::notify::Notifier;

/// Everything the scheduler and the webhook reconciler need from the outside
/// world. Cheap to clone; shared between the cron job and the HTTP server.
#[derive(Clone)]
pub struct PipelineContext {
    pub pool: Pool,
    pub flags: Arc<dyn FeatureFlags>,
    pub builds: Arc<dyn BuildService>,
    pub notifier: Arc<dyn Notifier>,
}

impl PipelineContext {
    pub fn new(
        pool: Pool,
        flags: Arc<dyn FeatureFlags>,
        builds: Arc<dyn BuildService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            pool,
            flags,
            builds,
            notifier,
        }
    }

    /// Whether publish-outcome emails are enabled for this kind of publish.
    pub fn emails_enabled(&self, is_scheduled: bool) -> bool {
        let key = if is_scheduled {
            crate::flags::EMAILS_FOR_SCHEDULED_PUBLISHES
        } else {
            crate::flags::EMAILS_FOR_PUBLISHES
        };
        self.flags.is_on(key)
    }
}
