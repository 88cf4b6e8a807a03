//! Pass pipeline configuration.
//!
//! A pipeline is written as a comma-separated list of pass names with
//! optional `name:option=value` settings. A bare `option=value` item
//! continues the options of the pass before it, so
//! `superopt:budget=2000,max-len=4` configures one pass.

use std::fmt;

use crate::error::{ConfigError, Result};

/// Names accepted by [`PipelineConfig::parse`], in registry order.
pub const PASS_NAMES: [&str; 5] = ["const-prop", "dse", "dce", "peephole", "superopt"];

/// Pipeline used when none is configured.
pub const DEFAULT_PIPELINE: &str = "const-prop,dse,dce,peephole";

pub const DEFAULT_WINDOW: usize = 3;
pub const MAX_WINDOW: usize = 4;
pub const DEFAULT_BUDGET: usize = 2000;
pub const MAX_BUDGET: usize = 1_000_000;
pub const DEFAULT_MAX_LEN: usize = 4;
pub const MAX_SEQUENCE_LEN: usize = 6;

/// One configured pass with typed options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassSpec {
    ConstProp,
    Dse,
    Dce,
    Peephole {
        window: usize,
    },
    Superopt {
        /// Candidate sequences tried per window.
        budget: usize,
        /// Longest sequence considered, in instructions.
        max_len: usize,
        seed: u64,
    },
}

impl PassSpec {
    /// Pass with default options.
    pub fn named(name: &str) -> Result<Self> {
        match name {
            "const-prop" => Ok(Self::ConstProp),
            "dse" => Ok(Self::Dse),
            "dce" => Ok(Self::Dce),
            "peephole" => Ok(Self::Peephole {
                window: DEFAULT_WINDOW,
            }),
            "superopt" => Ok(Self::Superopt {
                budget: DEFAULT_BUDGET,
                max_len: DEFAULT_MAX_LEN,
                seed: 0,
            }),
            other => Err(ConfigError::UnknownPass(other.to_string())),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ConstProp => "const-prop",
            Self::Dse => "dse",
            Self::Dce => "dce",
            Self::Peephole { .. } => "peephole",
            Self::Superopt { .. } => "superopt",
        }
    }

    /// Apply one `option=value` setting.
    pub fn set(&mut self, option: &str, value: &str) -> Result<()> {
        let pass = self.name();
        let invalid = |reason: String| ConfigError::InvalidPassOption {
            pass: pass.to_string(),
            option: option.to_string(),
            reason,
        };
        let ranged = |lo: usize, hi: usize| -> Result<usize> {
            let parsed: usize = value
                .trim()
                .parse()
                .map_err(|_| invalid(format!("expected an integer, got `{value}`")))?;
            if (lo..=hi).contains(&parsed) {
                Ok(parsed)
            } else {
                Err(invalid(format!("must be in {lo}..={hi}, got {parsed}")))
            }
        };
        match (self, option) {
            (Self::Peephole { window }, "window") => *window = ranged(1, MAX_WINDOW)?,
            (Self::Superopt { budget, .. }, "budget") => *budget = ranged(1, MAX_BUDGET)?,
            (Self::Superopt { max_len, .. }, "max-len") => {
                *max_len = ranged(1, MAX_SEQUENCE_LEN)?;
            }
            (Self::Superopt { seed, .. }, "seed") => {
                *seed = value
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("expected an integer, got `{value}`")))?;
            }
            _ => return Err(invalid("unknown option".to_string())),
        }
        Ok(())
    }
}

impl fmt::Display for PassSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peephole { window } => write!(f, "peephole:window={window}"),
            Self::Superopt {
                budget,
                max_len,
                seed,
            } => write!(f, "superopt:budget={budget},max-len={max_len},seed={seed}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Ordered, validated list of passes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub passes: Vec<PassSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            passes: vec![
                PassSpec::ConstProp,
                PassSpec::Dse,
                PassSpec::Dce,
                PassSpec::Peephole {
                    window: DEFAULT_WINDOW,
                },
            ],
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a pipeline description.
    pub fn parse(text: &str) -> Result<Self> {
        let mut passes: Vec<PassSpec> = Vec::new();
        for item in text.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let (head, option) = match item.split_once(':') {
                Some((name, option)) => (Some(name.trim()), Some(option.trim())),
                None if item.contains('=') => (None, Some(item)),
                None => (Some(item), None),
            };
            if let Some(name) = head {
                passes.push(PassSpec::named(name)?);
            }
            let Some(option) = option else { continue };
            let Some((key, value)) = option.split_once('=') else {
                let pass = head.unwrap_or_default();
                return Err(ConfigError::InvalidPassOption {
                    pass: pass.to_string(),
                    option: option.to_string(),
                    reason: "expected `option=value`".to_string(),
                });
            };
            let Some(spec) = passes.last_mut() else {
                return Err(ConfigError::InvalidPassOption {
                    pass: String::new(),
                    option: key.trim().to_string(),
                    reason: "option given before any pass".to_string(),
                });
            };
            spec.set(key.trim(), value)?;
        }
        Ok(Self { passes })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

impl fmt::Display for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pass) in self.passes.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{pass}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_pipeline() {
        let config = PipelineConfig::parse(DEFAULT_PIPELINE).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_parse_options() {
        let spec = "const-prop,dse,dce,peephole:window=2,superopt:budget=50,max-len=3";
        let config = PipelineConfig::parse(spec).unwrap();
        assert_eq!(config.passes.len(), 5);
        assert_eq!(config.passes[3], PassSpec::Peephole { window: 2 });
        assert_eq!(
            config.passes[4],
            PassSpec::Superopt {
                budget: 50,
                max_len: 3,
                seed: 0
            }
        );
    }

    #[test]
    fn test_unknown_pass_fails() {
        let err = PipelineConfig::parse("const-prop,licm").unwrap_err();
        assert_eq!(err, ConfigError::UnknownPass("licm".to_string()));
    }

    #[test]
    fn test_option_out_of_range() {
        let err = PipelineConfig::parse("peephole:window=9").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidPassOption { ref option, .. } if option == "window"
        ));
    }

    #[test]
    fn test_option_for_wrong_pass() {
        assert!(PipelineConfig::parse("dse:window=2").is_err());
        assert!(PipelineConfig::parse("budget=10").is_err());
        assert!(PipelineConfig::parse("peephole:window").is_err());
    }

    #[test]
    fn test_display_round_trips() {
        let config = PipelineConfig::parse("dce,superopt:budget=7,seed=9").unwrap();
        assert_eq!(PipelineConfig::parse(&config.to_string()).unwrap(), config);
    }
}
