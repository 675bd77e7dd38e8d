//! Command line arguments of the `run` command and the controller settings derived from them
use crate::retry::Backoff;
use snafu::{ensure, Snafu};
use stackable_operator::cli::ProductOperatorRun;
use std::{collections::BTreeSet, time::Duration};

/// CSI drivers known to need the consuming Pod recreated before an expanded volume is usable
pub const DEFAULT_SUPPORTED_PROVISIONERS: &[&str] = &[
    "ebs.csi.aws.com",
    "pd.csi.storage.gke.io",
    "disk.csi.azure.com",
    "dobs.csi.digitalocean.com",
    "linodebs.csi.linode.com",
    "csi.hetzner.cloud",
];

#[derive(Snafu, Debug, PartialEq)]
pub enum Error {
    #[snafu(display("at least one worker is required"))]
    NoWorkers,
    #[snafu(display("at least one supported provisioner is required"))]
    NoSupportedProvisioners,
    #[snafu(display("the resize poll needs at least one step"))]
    NoResizePollSteps,
    #[snafu(display("the resize poll factor must be at least 1"))]
    InvalidResizePollFactor,
    #[snafu(display("the requeue base delay must be positive"))]
    NoRequeueBaseDelay,
    #[snafu(display("the requeue max delay must not be below the base delay"))]
    RequeueMaxDelayBelowBase,
}

#[derive(clap::Parser, Debug)]
pub struct ReattachRun {
    #[clap(flatten)]
    pub common: ProductOperatorRun,

    /// Number of claims processed concurrently
    #[arg(long, env, default_value_t = 2)]
    pub workers: u16,

    /// Provisioners whose claims are reattached, comma separated
    #[arg(
        long,
        env,
        value_delimiter = ',',
        default_values_t = DEFAULT_SUPPORTED_PROVISIONERS.iter().map(|p| p.to_string())
    )]
    pub supported_provisioners: Vec<String>,

    /// Delay before the second check for a pending filesystem resize
    #[arg(long, env, default_value_t = 1000)]
    pub resize_poll_initial_delay_ms: u64,

    /// Multiplier applied to the delay after every check for a pending filesystem resize
    #[arg(long, env, default_value_t = 2)]
    pub resize_poll_factor: u32,

    /// How often the claim is checked for a pending filesystem resize before giving up
    #[arg(long, env, default_value_t = 6)]
    pub resize_poll_steps: u32,

    /// Upper bound for the delay between two checks for a pending filesystem resize
    #[arg(long, env, default_value_t = 60_000)]
    pub resize_poll_max_delay_ms: u64,

    /// Delay before a failed claim is retried for the first time, doubled on every failure
    #[arg(long, env, default_value_t = 1000)]
    pub requeue_base_delay_ms: u64,

    /// Upper bound for the retry delay of a failed claim
    #[arg(long, env, default_value_t = 300_000)]
    pub requeue_max_delay_ms: u64,
}

/// Validated controller settings
#[derive(Clone, Debug, PartialEq)]
pub struct ReattachConfig {
    pub workers: u16,
    pub supported_provisioners: BTreeSet<String>,
    pub resize_poll: Backoff,
    pub requeue_base_delay: Duration,
    pub requeue_max_delay: Duration,
}

impl Default for ReattachConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            supported_provisioners: DEFAULT_SUPPORTED_PROVISIONERS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            resize_poll: Backoff::default(),
            requeue_base_delay: Duration::from_secs(1),
            requeue_max_delay: Duration::from_secs(300),
        }
    }
}

impl TryFrom<&ReattachRun> for ReattachConfig {
    type Error = Error;

    fn try_from(run: &ReattachRun) -> Result<Self, Self::Error> {
        let supported_provisioners = run
            .supported_provisioners
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>();

        ensure!(run.workers > 0, NoWorkersSnafu);
        ensure!(!supported_provisioners.is_empty(), NoSupportedProvisionersSnafu);
        ensure!(run.resize_poll_steps > 0, NoResizePollStepsSnafu);
        ensure!(run.resize_poll_factor > 0, InvalidResizePollFactorSnafu);
        ensure!(run.requeue_base_delay_ms > 0, NoRequeueBaseDelaySnafu);
        ensure!(
            run.requeue_max_delay_ms >= run.requeue_base_delay_ms,
            RequeueMaxDelayBelowBaseSnafu
        );

        Ok(Self {
            workers: run.workers,
            supported_provisioners,
            resize_poll: Backoff {
                initial_delay: Duration::from_millis(run.resize_poll_initial_delay_ms),
                factor: run.resize_poll_factor,
                steps: run.resize_poll_steps,
                max_delay: Duration::from_millis(run.resize_poll_max_delay_ms),
            },
            requeue_base_delay: Duration::from_millis(run.requeue_base_delay_ms),
            requeue_max_delay: Duration::from_millis(run.requeue_max_delay_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::rstest;

    fn parse(args: &[&str]) -> ReattachRun {
        ReattachRun::try_parse_from(std::iter::once("run").chain(args.iter().copied()))
            .expect("illegal test input")
    }

    #[test]
    fn defaults_match_default_config() {
        let config = ReattachConfig::try_from(&parse(&[])).unwrap();
        assert_eq!(config, ReattachConfig::default());
    }

    #[test]
    fn every_setting_is_documented() {
        let command = <ReattachRun as clap::CommandFactory>::command();
        let undocumented = command
            .get_arguments()
            .filter(|arg| {
                [
                    "workers",
                    "supported_provisioners",
                    "resize_poll_initial_delay_ms",
                    "resize_poll_factor",
                    "resize_poll_steps",
                    "resize_poll_max_delay_ms",
                    "requeue_base_delay_ms",
                    "requeue_max_delay_ms",
                ]
                .contains(&arg.get_id().as_str())
            })
            .filter(|arg| arg.get_help().is_none())
            .map(|arg| arg.get_id().to_string())
            .collect::<Vec<_>>();
        assert!(undocumented.is_empty(), "undocumented: {undocumented:?}");
    }

    #[test]
    fn provisioners_are_comma_separated() {
        let config = ReattachConfig::try_from(&parse(&[
            "--supported-provisioners",
            "ebs.csi.aws.com, csi.example.org",
            "--workers",
            "8",
        ]))
        .unwrap();

        assert_eq!(config.workers, 8);
        assert_eq!(
            config.supported_provisioners,
            BTreeSet::from(["csi.example.org".to_string(), "ebs.csi.aws.com".to_string()])
        );
    }

    #[rstest]
    #[case(&["--workers", "0"], Error::NoWorkers)]
    #[case(&["--supported-provisioners", ""], Error::NoSupportedProvisioners)]
    #[case(&["--resize-poll-steps", "0"], Error::NoResizePollSteps)]
    #[case(&["--resize-poll-factor", "0"], Error::InvalidResizePollFactor)]
    #[case(&["--requeue-base-delay-ms", "0"], Error::NoRequeueBaseDelay)]
    #[case(&["--requeue-max-delay-ms", "0"], Error::RequeueMaxDelayBelowBase)]
    #[case(
        &["--requeue-base-delay-ms", "5000", "--requeue-max-delay-ms", "1000"],
        Error::RequeueMaxDelayBelowBase
    )]
    fn invalid_settings_are_rejected(#[case] args: &[&str], #[case] expected: Error) {
        assert_eq!(ReattachConfig::try_from(&parse(args)), Err(expected));
    }
}
