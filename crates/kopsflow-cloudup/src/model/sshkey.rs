//! The admin SSH key machines are launched with

use super::{ModelBuilder, ModelContext};
use crate::error::Result;
use crate::phase::Phase;
use kopsflow_fi::TaskMap;
use kopsflow_fi::tasks::SshKey;

pub struct SshKeyModelBuilder;

impl ModelBuilder for SshKeyModelBuilder {
    fn name(&self) -> &'static str {
        "ssh-key"
    }

    fn phase(&self) -> Phase {
        Phase::Security
    }

    fn build(&self, ctx: &ModelContext<'_>, tasks: &mut TaskMap) -> Result<()> {
        let (Some(name), Some(public_key)) = (ctx.ssh_key_name(), ctx.ssh_public_key) else {
            tracing::debug!("No admin SSH key registered; machines launch without one");
            return Ok(());
        };
        tasks.add(SshKey {
            name: name.to_string(),
            public_key: public_key.trim().to_string(),
            tags: ctx.owned_tags(name),
        })?;
        Ok(())
    }
}
