//! Files published to the registry for machines to read at boot

use super::{ModelBuilder, ModelContext};
use crate::error::Result;
use crate::phase::Phase;
use kopsflow_core::codec;
use kopsflow_fi::TaskMap;
use kopsflow_fi::tasks::ManagedFile;

/// Completed cluster spec, relative to the cluster root
pub const COMPLETED_SPEC: &str = "cluster-completed.spec";

pub struct ConfigModelBuilder;

impl ModelBuilder for ConfigModelBuilder {
    fn name(&self) -> &'static str {
        "config"
    }

    fn phase(&self) -> Phase {
        Phase::Cluster
    }

    fn build(&self, ctx: &ModelContext<'_>, tasks: &mut TaskMap) -> Result<()> {
        let completed = codec::encode(ctx.cluster)?;
        tasks.add(ManagedFile {
            name: COMPLETED_SPEC.to_string(),
            location: COMPLETED_SPEC.to_string(),
            contents: String::from_utf8_lossy(&completed).into_owned(),
            public: false,
        })?;

        for (ig, script) in ctx.bootstrap {
            let (Some(location), Some(config)) = (&script.config_location, &script.config) else {
                continue;
            };
            tasks.add(ManagedFile {
                name: format!("nodeupconfig-{ig}"),
                location: location.clone(),
                contents: config.clone(),
                public: false,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::Fixture;

    #[test]
    fn test_publishes_spec_and_nodeup_configs() {
        let fixture = Fixture::minimal();
        let mut tasks = TaskMap::new();
        ConfigModelBuilder.build(&fixture.context(), &mut tasks).unwrap();

        let locations: Vec<String> = tasks
            .iter()
            .map(|(_, entry)| entry.inputs["location"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            locations,
            vec![
                "cluster-completed.spec",
                "igconfig/controlplane/master-us-test-1a/nodeupconfig.yaml",
                "igconfig/node/nodes/nodeupconfig.yaml",
            ]
        );
    }
}
