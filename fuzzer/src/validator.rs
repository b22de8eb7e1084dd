//! Drive a simulation and summarize how far the nodes got.
//!
//! A run has two phases. During the run phase the network advances with every configured filter
//! in place. During the optional recovery phase faults may be lifted, giving a partitioned or
//! stalled network the chance to converge again. Round bounds over the nodes holding stake are
//! sampled before, between, and after the phases.

use crate::{config::FuzzerConfig, network::Network, telemetry, Error};
use faultline_agreement::{Builder, Round, Tick};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// Length of each phase of a run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Config {
    /// Ticks run with every filter in place.
    #[serde(default)]
    pub network_run_ticks: Tick,
    /// Ticks run after the run phase (none if zero).
    #[serde(default)]
    pub network_recover_ticks: Tick,
    /// Bypass every filter that is not passive before recovering.
    #[serde(default)]
    pub lift_faults: bool,
}

/// Progress of a [Validator].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    Running,
    Recovering,
    Done,
}

/// Round bounds over the nodes holding stake, sampled during a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunResult {
    pub start_low_round: Round,
    pub start_high_round: Round,
    pub pre_recovery_low_round: Round,
    pub pre_recovery_high_round: Round,
    pub post_recovery_low_round: Round,
    pub post_recovery_high_round: Round,
    /// No node holding stake advanced during the run phase.
    pub network_stalled: bool,
}

impl RunResult {
    /// Whether nodes disagreed on the round at the end of the run phase.
    pub fn partitioned(&self) -> bool {
        self.pre_recovery_low_round != self.pre_recovery_high_round
    }

    /// Whether the network made progress during recovery and ended within one round of
    /// agreement.
    pub fn recovered(&self) -> bool {
        self.post_recovery_high_round
            .saturating_sub(self.post_recovery_low_round)
            <= 1
            && self.post_recovery_high_round != self.pre_recovery_high_round
    }
}

/// Runs a simulation described by a [FuzzerConfig] with participants from a [Builder].
pub struct Validator {
    cfg: Config,
    builder: Arc<dyn Builder>,
    phase: Phase,
}

impl Validator {
    pub fn new(cfg: Config, builder: Arc<dyn Builder>) -> Self {
        Self {
            cfg,
            builder,
            phase: Phase::NotStarted,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Build the network of `config`, run both phases, and shut it down.
    ///
    /// Configuration errors are returned before any tick runs. A stalled network is not an
    /// error: it is reported in the [RunResult].
    pub async fn go(&mut self, config: &FuzzerConfig) -> Result<RunResult, Error> {
        telemetry::init(config.log_level);
        let mut network = Network::new(config, self.builder.as_ref())?;
        network.start()?;
        let result = self.drive(&mut network).await;
        network.shutdown().await;
        self.phase = Phase::Done;
        let result = result?;

        for factory in &config.filters {
            if let Some(report) = factory.report(config.tick_granularity) {
                info!(name = %config.name, filter = factory.name(), "{report}");
            }
        }
        info!(
            name = %config.name,
            start = ?(result.start_low_round, result.start_high_round),
            pre_recovery = ?(result.pre_recovery_low_round, result.pre_recovery_high_round),
            post_recovery = ?(result.post_recovery_low_round, result.post_recovery_high_round),
            stalled = result.network_stalled,
            "run complete"
        );
        Ok(result)
    }

    async fn drive(&mut self, network: &mut Network) -> Result<RunResult, Error> {
        let (start_low_round, start_high_round) = network.round_bounds();
        let start: Vec<Round> = network.nodes().iter().map(|node| node.current_round()).collect();

        self.phase = Phase::Running;
        network.run(self.cfg.network_run_ticks).await?;
        let (pre_recovery_low_round, pre_recovery_high_round) = network.round_bounds();
        let network_stalled = !network
            .nodes()
            .iter()
            .filter(|node| node.online())
            .any(|node| node.current_round() > start[node.id() as usize]);

        let (post_recovery_low_round, post_recovery_high_round) =
            if self.cfg.network_recover_ticks > 0 {
                self.phase = Phase::Recovering;
                if self.cfg.lift_faults {
                    network.lift_faults();
                }
                network.run(self.cfg.network_recover_ticks).await?;
                network.round_bounds()
            } else {
                (pre_recovery_low_round, pre_recovery_high_round)
            };

        Ok(RunResult {
            start_low_round,
            start_high_round,
            pre_recovery_low_round,
            pre_recovery_high_round,
            post_recovery_low_round,
            post_recovery_high_round,
            network_stalled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Fixture,
        filter::{
            duplicate::Duplicate,
            regossip::Regossip,
            scheduler::{Entry, Operation, Scheduler},
            statistics::{self, Format, Statistics},
            topology::Topology,
            Factory, Registry,
        },
    };
    use faultline_agreement::{mocks, NodeId};
    use serde_json::{json, Value};
    use std::{collections::BTreeMap, fs, path::Path, time::Duration};

    fn validator(network_run_ticks: Tick, network_recover_ticks: Tick, lift_faults: bool) -> Validator {
        Validator::new(
            Config {
                network_run_ticks,
                network_recover_ticks,
                lift_faults,
            },
            Arc::new(mocks::Builder::default()),
        )
    }

    /// Split `nodes` into two halves that cannot talk to each other.
    fn split(nodes: u32) -> Topology {
        let half = nodes / 2;
        let mut edges = BTreeMap::new();
        for node in 0..nodes {
            let side: Vec<NodeId> = if node < half {
                (0..half).collect()
            } else {
                (half..nodes).collect()
            };
            edges.insert(node, side);
        }
        Topology::new(edges)
    }

    /// Configuration of `nodes` nodes whose filters are parsed from a list of JSON blobs.
    fn parsed(name: &str, nodes: u32, filters: Value) -> FuzzerConfig {
        let filters: Vec<Value> = serde_json::from_value(filters).unwrap();
        Registry::default()
            .parse_all(&filters)
            .unwrap()
            .into_iter()
            .fold(FuzzerConfig::new(name, nodes), FuzzerConfig::with_factory)
    }

    #[test]
    fn test_config_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, Config::default());
        let cfg: Config =
            serde_json::from_str(r#"{"NetworkRunTicks": 5, "LiftFaults": true}"#).unwrap();
        assert_eq!(cfg.network_run_ticks, 5);
        assert!(cfg.lift_faults);
        assert!(serde_json::from_str::<Config>(r#"{"Ticks": 5}"#).is_err());
    }

    #[test]
    fn test_run_result_helpers() {
        let result = RunResult {
            start_low_round: 0,
            start_high_round: 0,
            pre_recovery_low_round: 3,
            pre_recovery_high_round: 7,
            post_recovery_low_round: 11,
            post_recovery_high_round: 12,
            network_stalled: false,
        };
        assert!(result.partitioned());
        assert!(result.recovered());

        let stuck = RunResult {
            post_recovery_low_round: 7,
            post_recovery_high_round: 7,
            pre_recovery_low_round: 7,
            ..result
        };
        assert!(!stuck.partitioned());
        assert!(!stuck.recovered());
    }

    #[tokio::test]
    async fn test_full_mesh_progress() {
        let config = FuzzerConfig::new("mesh", 4).with_filter(Duplicate::default());
        let mut validator = validator(100, 0, false);
        let result = validator.go(&config).await.unwrap();
        assert_eq!(validator.phase(), Phase::Done);
        assert!(!result.network_stalled);
        assert!(result.pre_recovery_low_round > result.start_high_round);
        assert_eq!(
            (result.post_recovery_low_round, result.post_recovery_high_round),
            (result.pre_recovery_low_round, result.pre_recovery_high_round)
        );
    }

    #[tokio::test]
    async fn test_circular_topology_progress() {
        let config = FuzzerConfig::new("ring", 6)
            .with_filter(Topology::circular(6))
            .with_filter(Duplicate::default());
        let result = validator(200, 0, false).go(&config).await.unwrap();
        assert!(!result.network_stalled);
    }

    #[tokio::test]
    async fn test_stall_detected() {
        // Nobody can talk to anybody.
        let config = FuzzerConfig::new("silent", 4).with_filter(Topology::default());
        let result = validator(100, 0, false).go(&config).await.unwrap();
        assert!(result.network_stalled);
        assert!(!result.partitioned());
    }

    #[tokio::test]
    async fn test_recovery_after_lifting_faults() {
        let config = FuzzerConfig::new("split", 4).with_filter(split(4));
        let result = validator(100, 200, true).go(&config).await.unwrap();
        assert!(result.network_stalled);
        assert!(result.post_recovery_high_round > result.pre_recovery_high_round);
        assert!(result.recovered());
    }

    #[tokio::test]
    async fn test_recovery_after_scheduled_partition() {
        // The partition only holds during the first 100 ticks.
        let partition = Scheduler::new(
            "partition",
            vec![Arc::new(split(4)) as Arc<dyn Factory>],
            vec![Entry::between(0, 100, (0..4).collect())],
        );
        let config = FuzzerConfig::new("scheduled", 4).with_filter(partition);
        let result = validator(100, 200, false).go(&config).await.unwrap();
        assert!(result.network_stalled);
        assert!(result.recovered());
    }

    #[tokio::test]
    async fn test_configuration_errors_abort_the_run() {
        let config = FuzzerConfig::new("broken", 2).with_online(vec![true]);
        let mut validator = validator(10, 0, false);
        assert!(matches!(
            validator.go(&config).await,
            Err(Error::InvalidOnlineNodes {
                expected: 2,
                found: 1
            })
        ));
        assert_eq!(validator.phase(), Phase::NotStarted);
    }

    #[tokio::test]
    async fn test_recovery_from_reordering() {
        for (nodes, send, receive) in [(5, 3, 3), (8, 5, 0), (5, 0, 5)] {
            let config = parsed(
                &format!("reordering-{nodes}-{send}-{receive}"),
                nodes,
                json!([{
                    "Name": "MessageReorderingFilter",
                    "NodesShuffleConfig": {
                        "0": {
                            "SendShuffleSize": send,
                            "ReceiveShuffleSize": receive,
                            "MaxRetentionTicks": 10
                        }
                    }
                }]),
            );
            let result = validator(200, 200, true).go(&config).await.unwrap();
            assert!(!result.network_stalled, "{}: {result:?}", config.name);
            assert!(result.recovered(), "{}: {result:?}", config.name);
        }
    }

    #[tokio::test]
    async fn test_recovery_from_duplication() {
        let config = parsed(
            "duplication",
            5,
            json!([
                {
                    "Name": "MessageDuplicationFilter",
                    "Outgoing": {"0": {"*": 2}, "2": {"AV": 3}, "4": {"VB": 1}},
                    "Incoming": {"1": {"*": 2}, "3": {"PP": 1, "*": 1}}
                },
                {
                    "Name": "MessageDuplicationFilter",
                    "Outgoing": {"3": {"*": 1}},
                    "Incoming": {"0": {"AV": 2}}
                }
            ]),
        );
        let result = validator(200, 200, true).go(&config).await.unwrap();
        assert!(!result.network_stalled);
        assert!(result.recovered(), "{result:?}");
    }

    #[tokio::test]
    async fn test_recovery_from_reflection() {
        let config = parsed(
            "reflection",
            5,
            json!([
                {
                    "Name": "MessageReflectionFilter",
                    "Outgoing": {"0": {"VB": 2}, "3": {"AV": 1}},
                    "Incoming": {"1": {"PP": 2}, "2": {"AV": 1}}
                },
                {
                    "Name": "MessageReflectionFilter",
                    "Outgoing": {"4": {"VB": 1}},
                    "Replace": true
                }
            ]),
        );
        let result = validator(200, 200, true).go(&config).await.unwrap();
        assert!(!result.network_stalled);
        assert!(result.recovered(), "{result:?}");
    }

    #[tokio::test]
    async fn test_recovery_from_bandwidth_limits() {
        // Node 1 can send far less than the protocol offers and sheds what exceeds its backlog.
        // The other four nodes form a quorum on their own.
        let config = parsed(
            "bandwidth",
            5,
            json!([{
                "Name": "BandwidthFilter",
                "Upstream": {"1": 2000},
                "Downstream": {"1": 20000},
                "MaxBacklog": 8000
            }]),
        );
        let result = validator(200, 200, true).go(&config).await.unwrap();
        assert!(!result.network_stalled);
        assert!(result.recovered(), "{result:?}");
    }

    #[tokio::test]
    async fn test_scheduled_cert_vote_drops() {
        // Node 0 is cut off first, then nobody's cert votes get through, then node 0 has to
        // catch up from bundles for a round.
        let isolated = json!({
            "Name": "TopologyFilter",
            "NodesConnection": {
                "0": [],
                "1": [2, 3, 4],
                "2": [1, 3, 4],
                "3": [1, 2, 4],
                "4": [1, 2, 3]
            }
        });
        let config = parsed(
            "cert-vote-drops",
            5,
            json!([
                {
                    "Name": "SchedulerFilter",
                    "ScheduleName": "disconnect",
                    "Filters": [isolated],
                    "Schedule": [{"Operation": 0, "FirstTick": 50, "Nodes": [0, 1, 2, 3, 4]}]
                },
                {
                    "Name": "SchedulerFilter",
                    "ScheduleName": "drop-certs",
                    "Filters": [{
                        "Name": "VoteFilter",
                        "IncludeMasks": [{"StartStep": 0, "EndStep": 2}],
                        "ExcludeMasks": [{"StartStep": 2, "EndStep": 3}]
                    }],
                    "Schedule": [{
                        "Operation": 2,
                        "FirstTick": 50,
                        "SecondTick": 150,
                        "Nodes": [0, 1, 2, 3, 4]
                    }]
                },
                {
                    "Name": "SchedulerFilter",
                    "ScheduleName": "catchup",
                    "Filters": [{"Name": "CatchupFilter", "Nodes": [0], "Count": 1}],
                    "Schedule": [{"Operation": 4, "FirstTick": 150, "Nodes": [0, 1, 2, 3, 4]}]
                }
            ]),
        );
        let mut network = Network::new(&config, &mocks::Builder::default()).unwrap();
        network.start().unwrap();

        // The connected quorum progresses without node 0.
        network.run(50).await.unwrap();
        let (low, reached) = network.round_bounds();
        assert_eq!(low, 1);
        assert!(reached > 1);

        // Without cert votes nobody commits, but node 0 catches up from relayed bundles.
        network.run(99).await.unwrap();
        assert_eq!(network.round_bounds(), (reached, reached));

        network.run(251).await.unwrap();
        let (low, high) = network.round_bounds();
        assert!(low > reached, "stuck at {low}");
        assert!(high - low <= 1);
        network.shutdown().await;
    }

    /// Relays (`0..relays`) hold no stake, nodes after them do.
    fn staked(relays: u32, nodes: u32, staked: u32) -> Vec<bool> {
        (0..relays + nodes)
            .map(|id| id >= relays && id < relays + staked)
            .collect()
    }

    #[tokio::test]
    async fn test_staked_network_quadratic_growth() {
        let relays = 1;
        let node_counts: Vec<u32> = (4..=10).collect();
        let mut relayed = Vec::new();
        for nodes in node_counts.iter().copied() {
            let statistics = Statistics::new(Format::None);
            let config = FuzzerConfig::new(format!("quadratic-{nodes}"), relays + nodes)
                .with_online(staked(relays, nodes, nodes))
                .with_filter(Duplicate::default())
                .with_filter(Topology::relays(relays, nodes, 2, 0))
                .with_filter(statistics.clone());
            validator(150, 0, false).go(&config).await.unwrap();
            relayed.push(statistics.traffic(0).unwrap().outgoing.messages as f64);
        }

        // Fit a parabola through the first two samples and the previous one.
        let xs: Vec<f64> = node_counts.iter().map(|n| f64::from(*n)).collect();
        for i in 3..relayed.len() {
            let (x, y) = ([xs[0], xs[1], xs[i - 1]], [relayed[0], relayed[1], relayed[i - 1]]);
            let predicted: f64 = (0..3)
                .map(|j| {
                    let mut term = y[j];
                    for m in (0..3).filter(|m| *m != j) {
                        term *= (xs[i] - x[m]) / (x[j] - x[m]);
                    }
                    term
                })
                .sum();
            assert!(
                (predicted - relayed[i]).abs() < relayed[i],
                "non-quadratic growth with {} nodes: predicted {predicted}, found {}",
                node_counts[i],
                relayed[i]
            );
        }
    }

    #[tokio::test]
    async fn test_unstaked_network_linear_growth() {
        let (relays, staked_count) = (8, 4);
        let node_counts = [
            staked_count,
            relays + staked_count * 2,
            3 * relays + staked_count * 4,
        ];
        let granularity = Duration::from_millis(100);
        let mut rates = Vec::new();
        for nodes in node_counts {
            let statistics = Statistics::new(Format::None);
            let config = FuzzerConfig::new(format!("linear-{nodes}"), relays + nodes)
                .with_online(staked(relays, nodes, staked_count))
                .with_tick_granularity(granularity)
                .with_filter(Duplicate::default())
                .with_filter(Topology::relays(relays, nodes, 4, 0))
                .with_filter(statistics.clone());
            validator(150, 0, false).go(&config).await.unwrap();

            let peak = (0..relays)
                .filter_map(|relay| statistics.traffic(relay))
                .map(|traffic| traffic.outgoing.peak_bytes())
                .max()
                .unwrap_or_default();
            rates.push(statistics::rate(peak, granularity) as f64);
        }

        // Relay load grows at most linearly with the size of the network.
        for i in 1..rates.len() {
            let ratio = f64::from(relays + node_counts[i]) / f64::from(relays + node_counts[i - 1]);
            assert!(rates[i - 1] > 0.0);
            assert!(
                rates[i] / ratio < rates[i - 1] * 1.25,
                "relay load grew from {} to {} B/s with a {ratio} node ratio",
                rates[i - 1],
                rates[i]
            );
        }
    }

    #[tokio::test]
    async fn test_regossip_elimination() {
        let (relays, nodes) = (8, 20);
        let online = staked(relays, nodes, nodes);
        let topology = Topology::relays(relays, nodes, 4, 0);

        let baseline = Statistics::new(Format::Nodes);
        let config = FuzzerConfig::new("regossip-baseline", relays + nodes)
            .with_online(online.clone())
            .with_filter(topology.clone())
            .with_filter(Duplicate::default())
            .with_filter(baseline.clone());
        validator(150, 0, false).go(&config).await.unwrap();

        let eliminated = Statistics::new(Format::Nodes);
        let regossip = Scheduler::new(
            "eliminate-regossip",
            vec![Arc::new(Regossip::default()) as Arc<dyn Factory>],
            vec![Entry::new(
                Operation::NotBefore,
                0,
                (relays..relays + nodes).collect(),
            )],
        );
        let config = FuzzerConfig::new("regossip-eliminated", relays + nodes)
            .with_online(online)
            .with_filter(regossip)
            .with_filter(topology)
            .with_filter(Duplicate::default())
            .with_filter(eliminated.clone());
        validator(150, 0, false).go(&config).await.unwrap();

        assert!(eliminated.total_sent() < baseline.total_sent());
    }

    #[tokio::test]
    async fn test_fixtures() {
        let directory = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures");
        let mut paths: Vec<_> = fs::read_dir(directory)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().is_some_and(|extension| extension == "json"))
            .collect();
        paths.sort();

        let registry = Registry::default();
        let mut ran = 0;
        for path in paths {
            let fixture = Fixture::from_json(&fs::read_to_string(&path).unwrap()).unwrap();
            let Some(config) = fixture.resolve(&registry).unwrap() else {
                continue;
            };
            let result = Validator::new(
                fixture.validator.clone(),
                Arc::new(mocks::Builder::default()),
            )
            .go(&config)
            .await
            .unwrap();
            if fixture.validator.network_recover_ticks > 0 {
                assert!(result.recovered(), "{}: {result:?}", fixture.fuzzer_name);
            } else {
                assert!(!result.network_stalled, "{}: {result:?}", fixture.fuzzer_name);
            }
            ran += 1;
        }

        // The fixture using an unknown filter is skipped.
        assert_eq!(ran, 3);
    }
}
