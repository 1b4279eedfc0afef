//! Wipe method → overwrite pass table.

use crate::config::EngineConfig;
use crate::process::CommandSpec;
use crate::request::WipeMethod;
use crate::EngineError;
use serde::{Deserialize, Serialize};

pub const GUTMANN_PASSES: usize = 35;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillPattern {
    Zero,
    Random,
}

/// One full-device overwrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSpec {
    pub fill: FillPattern,
    pub command: CommandSpec,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct PassPlanner {
    dd: String,
    block_size: String,
    zero_source: String,
    random_source: String,
}

impl PassPlanner {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            dd: config.tools.dd.clone(),
            block_size: config.block_size.clone(),
            zero_source: config.zero_source.clone(),
            random_source: config.random_source.clone(),
        }
    }

    /// Plan the passes for a method given by name.
    pub fn plan(&self, method: &str, device: &str) -> Result<Vec<PassSpec>, EngineError> {
        let method: WipeMethod = method.parse()?;
        Ok(self.plan_method(method, device))
    }

    pub fn plan_method(&self, method: WipeMethod, device: &str) -> Vec<PassSpec> {
        match method {
            WipeMethod::Zero => vec![self.pass(FillPattern::Zero, device, true, "Zero fill pass".to_string())],
            WipeMethod::Random => {
                vec![self.pass(FillPattern::Random, device, true, "Random data pass".to_string())]
            }
            WipeMethod::Dod => vec![
                self.pass(FillPattern::Zero, device, false, "DoD pass 1: zero fill".to_string()),
                self.pass(FillPattern::Random, device, false, "DoD pass 2: random data".to_string()),
                self.pass(FillPattern::Zero, device, false, "DoD pass 3: zero fill".to_string()),
            ],
            WipeMethod::Gutmann => (1..=GUTMANN_PASSES)
                .map(|i| {
                    self.pass(
                        FillPattern::Random,
                        device,
                        false,
                        format!("Gutmann pass {}/{}", i, GUTMANN_PASSES),
                    )
                })
                .collect(),
        }
    }

    fn pass(&self, fill: FillPattern, device: &str, sync: bool, description: String) -> PassSpec {
        let source = match fill {
            FillPattern::Zero => &self.zero_source,
            FillPattern::Random => &self.random_source,
        };

        let mut args = vec![
            format!("if={}", source),
            format!("of={}", device),
            format!("bs={}", self.block_size),
        ];
        // Single-pass methods sync every block so the final pass really hits the media.
        if sync {
            args.push("oflag=sync".to_string());
        }
        args.push("status=progress".to_string());

        PassSpec {
            fill,
            command: CommandSpec::new(&self.dd, args),
            description,
        }
    }
}
