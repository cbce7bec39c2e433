//! Pipeline Graph: static wiring of stages, joins and aggregates, validated
//! once at build time and instantiated with fresh channels for every run.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::defs::{GraphBuildError, PipelineError, DEFAULT_CHANNEL_BUFFER};
use crate::engine::aggregate::{run_aggregate, AggregateReport, AggregateSpec};
use crate::engine::join::{run_join, JoinReport, JoinSpec};
use crate::engine::stage::{run_stage, StageReport, StageSpec};
use crate::engine::task::StageTask;
use crate::utils::streams::{Channel, Tuple, TupleReceiver};


enum Node {
    Stage {
        spec: Arc<StageSpec>,
        task: Arc<dyn StageTask>,
        input: String,
        output: String,
    },
    Join {
        spec: JoinSpec,
        output: String,
    },
    Aggregate {
        spec: AggregateSpec,
        input: String,
    },
}

impl Node {
    fn name(&self) -> &str {
        match self {
            Node::Stage { spec, .. } => &spec.name,
            Node::Join { spec, .. } => &spec.name,
            Node::Aggregate { spec, .. } => &spec.name,
        }
    }

    fn inputs(&self) -> Vec<&str> {
        match self {
            Node::Stage { input, .. } | Node::Aggregate { input, .. } => vec![input.as_str()],
            Node::Join { spec, .. } => spec.inputs.iter().map(String::as_str).collect(),
        }
    }

    fn output(&self) -> Option<&str> {
        match self {
            Node::Stage { output, .. } | Node::Join { output, .. } => Some(output.as_str()),
            Node::Aggregate { .. } => None,
        }
    }
}


/// Collects the graph declaration; nothing is checked until `build`.
#[derive(Default)]
pub struct GraphBuilder {
    sources: Vec<(String, Vec<String>)>,
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the channel seeded with discovered samples and the artifacts each seed carries.
    pub fn source(mut self, channel: &str, artifacts: &[&str]) -> Self {
        self.sources.push((
            channel.to_string(),
            artifacts.iter().map(|a| a.to_string()).collect(),
        ));
        self
    }

    pub fn stage(mut self, spec: StageSpec, task: Arc<dyn StageTask>, input: &str, output: &str) -> Self {
        self.nodes.push(Node::Stage {
            spec: Arc::new(spec),
            task,
            input: input.to_string(),
            output: output.to_string(),
        });
        self
    }

    /// Registers a stage only when `enabled`; the rest of the wiring is untouched either way.
    pub fn optional_stage(
        self,
        enabled: bool,
        spec: StageSpec,
        task: impl FnOnce() -> Arc<dyn StageTask>,
        input: &str,
        output: &str,
    ) -> Self {
        if enabled {
            self.stage(spec, task(), input, output)
        } else {
            debug!("Optional stage {} not registered", spec.name);
            self
        }
    }

    /// Joined output is the channel named `output`.
    pub fn join(mut self, spec: JoinSpec, output: &str) -> Self {
        self.nodes.push(Node::Join {
            spec,
            output: output.to_string(),
        });
        self
    }

    pub fn aggregate(mut self, spec: AggregateSpec, input: &str) -> Self {
        self.nodes.push(Node::Aggregate {
            spec,
            input: input.to_string(),
        });
        self
    }

    pub fn optional_aggregate(self, enabled: bool, spec: AggregateSpec, input: &str) -> Self {
        if enabled { self.aggregate(spec, input) } else { self }
    }

    /// Validates names, wiring, acyclicity and artifact availability.
    ///
    /// # Returns
    /// Graph with nodes in topological order, or the first GraphBuildError found.
    pub fn build(self) -> Result<Graph, GraphBuildError> {
        let GraphBuilder { mut sources, nodes } = self;
        let (source, source_artifacts) = match sources.len() {
            0 => return Err(GraphBuildError::NoSource),
            1 => sources.remove(0),
            _ => return Err(GraphBuildError::MultipleSources),
        };

        let mut names = HashSet::new();
        for node in &nodes {
            if !names.insert(node.name()) {
                return Err(GraphBuildError::DuplicateName(node.name().to_string()));
            }
        }

        // None = the source channel, Some(i) = nodes[i]
        let mut producers: HashMap<&str, Option<usize>> = HashMap::new();
        producers.insert(source.as_str(), None);
        for (i, node) in nodes.iter().enumerate() {
            if let Some(output) = node.output() {
                if producers.insert(output, Some(i)).is_some() {
                    return Err(GraphBuildError::DuplicateProducer(output.to_string()));
                }
            }
        }

        for node in &nodes {
            match node {
                Node::Stage { spec, .. } if spec.max_concurrency == 0 => {
                    return Err(GraphBuildError::InvalidConcurrency(spec.name.clone()));
                }
                Node::Join { spec, .. } => {
                    let distinct: HashSet<&String> = spec.inputs.iter().collect();
                    if spec.arity() < 2 || distinct.len() != spec.arity() {
                        return Err(GraphBuildError::InvalidJoin(spec.name.clone()));
                    }
                }
                _ => {}
            }
            for input in node.inputs() {
                if !producers.contains_key(input) {
                    return Err(GraphBuildError::UnknownChannel {
                        node: node.name().to_string(),
                        channel: input.to_string(),
                    });
                }
            }
        }

        let order = topological_order(&nodes, &producers)?;

        // Artifacts carried by each channel, resolved in topological order.
        let mut carried: HashMap<String, BTreeSet<String>> = HashMap::new();
        carried.insert(source.clone(), source_artifacts.iter().cloned().collect());
        for &i in &order {
            match &nodes[i] {
                Node::Stage { spec, input, output, .. } => {
                    require(&carried, &spec.name, input, &spec.inputs)?;
                    carried.insert(output.clone(), spec.outputs.iter().cloned().collect());
                }
                Node::Join { spec, output } => {
                    let union = spec
                        .inputs
                        .iter()
                        .flat_map(|input| carried.get(input).cloned().unwrap_or_default())
                        .collect();
                    carried.insert(output.clone(), union);
                }
                Node::Aggregate { spec, input } => {
                    require(&carried, &spec.name, input, std::slice::from_ref(&spec.artifact))?;
                }
            }
        }

        let mut slots: Vec<Option<Node>> = nodes.into_iter().map(Some).collect();
        let nodes = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(Graph {
            source,
            source_artifacts,
            nodes,
            carried,
        })
    }
}

fn require(
    carried: &HashMap<String, BTreeSet<String>>,
    node: &str,
    channel: &str,
    needed: &[String],
) -> Result<(), GraphBuildError> {
    let available = carried.get(channel);
    for artifact in needed {
        if !available.is_some_and(|set| set.contains(artifact)) {
            return Err(GraphBuildError::UnsatisfiedInput {
                stage: node.to_string(),
                artifact: artifact.clone(),
                channel: channel.to_string(),
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm over node indices, stable in declaration order.
fn topological_order(
    nodes: &[Node],
    producers: &HashMap<&str, Option<usize>>,
) -> Result<Vec<usize>, GraphBuildError> {
    let mut indegree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for input in node.inputs() {
            if let Some(Some(upstream)) = producers.get(input) {
                indegree[i] += 1;
                dependents[*upstream].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() < nodes.len() {
        let mut stuck: Vec<String> = (0..nodes.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| nodes[i].name().to_string())
            .collect();
        stuck.sort();
        return Err(GraphBuildError::CycleDetected(stuck));
    }
    Ok(order)
}


pub struct RunContext {
    pub work_root: PathBuf,
    pub channel_capacity: usize,
    pub abort: watch::Receiver<bool>,
}

impl RunContext {
    /// Context with no abort source.
    pub fn new(work_root: PathBuf) -> Self {
        let (_tx, abort) = watch::channel(false);
        RunContext {
            work_root,
            channel_capacity: DEFAULT_CHANNEL_BUFFER,
            abort,
        }
    }
}

#[derive(Debug, Default)]
pub struct GraphReport {
    pub stages: Vec<StageReport>,
    pub joins: Vec<JoinReport>,
    pub aggregates: Vec<AggregateReport>,
}

impl GraphReport {
    pub fn aborted(&self) -> bool {
        self.stages.iter().any(|s| s.aborted)
    }
}

enum NodeOutcome {
    Stage(StageReport),
    Join(JoinReport),
    Aggregate(Result<AggregateReport, PipelineError>),
}


/// A validated pipeline. Immutable; `run` may be called more than once.
pub struct Graph {
    source: String,
    source_artifacts: Vec<String>,
    nodes: Vec<Node>,
    carried: HashMap<String, BTreeSet<String>>,
}

impl Graph {
    /// Node names in execution (topological) order.
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(Node::name).collect()
    }

    pub fn stage_specs(&self) -> Vec<&StageSpec> {
        self.nodes
            .iter()
            .filter_map(|n| match n {
                Node::Stage { spec, .. } => Some(spec.as_ref()),
                _ => None,
            })
            .collect()
    }

    pub fn aggregate_specs(&self) -> Vec<&AggregateSpec> {
        self.nodes
            .iter()
            .filter_map(|n| match n {
                Node::Aggregate { spec, .. } => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn channel_artifacts(&self, channel: &str) -> Option<&BTreeSet<String>> {
        self.carried.get(channel)
    }

    /// Seeds the source channel and drives every node until all channels close.
    ///
    /// # Arguments
    ///
    /// * `seeds` - One tuple per discovered sample.
    /// * `ctx` - Work root, channel capacity and abort flag.
    ///
    /// # Returns
    /// GraphReport, or the first aggregate write failure.
    pub async fn run(&self, seeds: Vec<Tuple>, ctx: RunContext) -> Result<GraphReport, PipelineError> {
        let mut seen = HashSet::new();
        for seed in &seeds {
            if !seed.key.is_path_safe() {
                return Err(PipelineError::InvalidConfig(format!(
                    "Sample key '{}' cannot name a work directory",
                    seed.key
                )));
            }
            if !seen.insert(&seed.key) {
                return Err(PipelineError::InvalidConfig(format!("Duplicate sample key {}", seed.key)));
            }
            if let Some(missing) = self.source_artifacts.iter().find(|a| !seed.artifacts.contains(a)) {
                return Err(PipelineError::InvalidConfig(format!(
                    "Sample {} lacks source artifact '{}'",
                    seed.key, missing
                )));
            }
        }

        let mut channels: HashMap<&str, Channel> = HashMap::new();
        channels.insert(&self.source, Channel::new(&self.source, ctx.channel_capacity));
        for node in &self.nodes {
            if let Some(output) = node.output() {
                channels.insert(output, Channel::new(output, ctx.channel_capacity));
            }
        }

        // Every consumer subscribes before anything is sent.
        let mut subscriptions: Vec<Vec<TupleReceiver>> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut receivers = Vec::new();
            for input in node.inputs() {
                let channel = channels
                    .get(input)
                    .ok_or_else(|| anyhow!("Channel {} missing at run time", input))?;
                receivers.push(channel.subscribe());
            }
            subscriptions.push(receivers);
        }

        let mut running: JoinSet<(usize, NodeOutcome)> = JoinSet::new();
        for (i, (node, mut receivers)) in self.nodes.iter().zip(subscriptions).enumerate() {
            let output = node.output().and_then(|o| channels.get(o).cloned());
            match (node, output) {
                (Node::Stage { spec, task, .. }, Some(output)) => {
                    let input = receivers.remove(0);
                    let fut = run_stage(
                        spec.clone(),
                        task.clone(),
                        input,
                        output,
                        ctx.work_root.clone(),
                        ctx.abort.clone(),
                    );
                    running.spawn(async move { (i, NodeOutcome::Stage(fut.await)) });
                }
                (Node::Join { spec, .. }, Some(output)) => {
                    let fut = run_join(spec.clone(), receivers, output);
                    running.spawn(async move { (i, NodeOutcome::Join(fut.await)) });
                }
                (Node::Aggregate { spec, .. }, _) => {
                    let input = receivers.remove(0);
                    let fut = run_aggregate(spec.clone(), input);
                    running.spawn(async move { (i, NodeOutcome::Aggregate(fut.await)) });
                }
                _ => return Err(anyhow!("Node {} has no output channel", node.name()).into()),
            }
        }

        let source = channels
            .remove(self.source.as_str())
            .ok_or_else(|| anyhow!("Source channel missing"))?;
        drop(channels);
        info!("Seeding {} sample(s) into '{}'", seeds.len(), self.source);
        for seed in seeds {
            source.send(seed).await;
        }
        source.close();

        let mut outcomes: Vec<Option<NodeOutcome>> = (0..self.nodes.len()).map(|_| None).collect();
        while let Some(joined) = running.join_next().await {
            let (i, outcome) = joined.map_err(|e| anyhow!("Pipeline node task failed: {}", e))?;
            outcomes[i] = Some(outcome);
        }

        let mut report = GraphReport::default();
        let mut first_error = None;
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                NodeOutcome::Stage(r) => report.stages.push(r),
                NodeOutcome::Join(r) => report.joins.push(r),
                NodeOutcome::Aggregate(Ok(r)) => report.aggregates.push(r),
                NodeOutcome::Aggregate(Err(e)) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use tempfile::tempdir;
    use crate::engine::task::TaskContext;
    use crate::utils::streams::{Artifacts, SampleKey};

    struct Touch;

    #[async_trait]
    impl StageTask for Touch {
        async fn run(&self, ctx: &TaskContext) -> Result<Artifacts> {
            let mut produced = Artifacts::new();
            for name in &ctx.outputs {
                let path = ctx.output_path(&format!(".{}", name));
                tokio::fs::write(&path, format!("{}\t{}\n", ctx.key, name)).await?;
                produced.insert(name.clone(), path);
            }
            Ok(produced)
        }
    }

    fn stage(name: &str, inputs: &[&str], outputs: &[&str]) -> StageSpec {
        StageSpec::new(name).inputs(inputs).outputs(outputs).max_concurrency(2)
    }

    fn aggregate(name: &str, artifact: &str, path: PathBuf) -> AggregateSpec {
        AggregateSpec {
            name: name.to_string(),
            artifact: artifact.to_string(),
            path,
            has_header: false,
        }
    }

    #[test]
    fn test_build_orders_nodes_topologically() {
        let graph = GraphBuilder::new()
            .join(JoinSpec::new("ab", &["a", "b"]), "ab_out")
            .stage(stage("b", &["x"], &["y"]), Arc::new(Touch), "a", "b")
            .stage(stage("a", &["r"], &["x"]), Arc::new(Touch), "src", "a")
            .source("src", &["r"])
            .build()
            .unwrap();
        assert_eq!(graph.node_names(), vec!["a", "b", "ab"]);
        let carried: Vec<&String> = graph.channel_artifacts("ab_out").unwrap().iter().collect();
        assert_eq!(carried, vec!["x", "y"]);
    }

    #[test]
    fn test_build_rejects_cycle() {
        let err = GraphBuilder::new()
            .source("src", &["r"])
            .stage(stage("a", &[], &["x"]), Arc::new(Touch), "b_out", "a_out")
            .stage(stage("b", &[], &["x"]), Arc::new(Touch), "a_out", "b_out")
            .build()
            .err()
            .unwrap();
        assert_eq!(err, GraphBuildError::CycleDetected(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn test_build_rejects_unsatisfied_input() {
        let err = GraphBuilder::new()
            .source("src", &["r"])
            .stage(stage("a", &["r"], &["x"]), Arc::new(Touch), "src", "a")
            .stage(stage("b", &["r"], &["y"]), Arc::new(Touch), "a", "b")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, GraphBuildError::UnsatisfiedInput { ref stage, ref artifact, .. } if stage == "b" && artifact == "r"));
    }

    #[test]
    fn test_build_rejects_bad_wiring() {
        let dup = GraphBuilder::new()
            .source("src", &["r"])
            .stage(stage("a", &["r"], &["x"]), Arc::new(Touch), "src", "a")
            .stage(stage("a", &["r"], &["x"]), Arc::new(Touch), "src", "a2")
            .build();
        assert_eq!(dup.err(), Some(GraphBuildError::DuplicateName("a".into())));

        let unknown = GraphBuilder::new()
            .source("src", &["r"])
            .stage(stage("a", &["r"], &["x"]), Arc::new(Touch), "nowhere", "a")
            .build();
        assert!(matches!(unknown.err(), Some(GraphBuildError::UnknownChannel { .. })));

        let producers = GraphBuilder::new()
            .source("src", &["r"])
            .stage(stage("a", &["r"], &["x"]), Arc::new(Touch), "src", "out")
            .stage(stage("b", &["r"], &["x"]), Arc::new(Touch), "src", "out")
            .build();
        assert_eq!(producers.err(), Some(GraphBuildError::DuplicateProducer("out".into())));

        let join = GraphBuilder::new()
            .source("src", &["r"])
            .join(JoinSpec::new("j", &["src", "src"]), "j")
            .build();
        assert_eq!(join.err(), Some(GraphBuildError::InvalidJoin("j".into())));

        let zero = GraphBuilder::new()
            .source("src", &["r"])
            .stage(stage("a", &["r"], &["x"]).max_concurrency(0), Arc::new(Touch), "src", "a")
            .build();
        assert_eq!(zero.err(), Some(GraphBuildError::InvalidConcurrency("a".into())));

        assert_eq!(GraphBuilder::new().build().err(), Some(GraphBuildError::NoSource));
    }

    #[test]
    fn test_optional_stage_leaves_wiring_intact() {
        let build = |enabled: bool| {
            GraphBuilder::new()
                .source("src", &["r"])
                .stage(stage("a", &["r"], &["x"]), Arc::new(Touch), "src", "a")
                .optional_stage(enabled, stage("extra", &["r"], &["e"]), || Arc::new(Touch), "src", "extra")
                .optional_aggregate(enabled, aggregate("extra_table", "e", PathBuf::from("e.txt")), "extra")
                .build()
                .unwrap()
        };
        assert_eq!(build(false).node_names(), vec!["a"]);
        assert_eq!(build(true).node_names(), vec!["a", "extra", "extra_table"]);
    }

    #[tokio::test]
    async fn test_run_tee_join_and_aggregate() {
        let dir = tempdir().unwrap();
        let graph = GraphBuilder::new()
            .source("src", &["r"])
            .stage(stage("left", &["r"], &["l"]), Arc::new(Touch), "src", "left")
            .stage(stage("right", &["r"], &["rr"]), Arc::new(Touch), "src", "right")
            .join(JoinSpec::new("both", &["left", "right"]), "both")
            .stage(stage("merge", &["l", "rr"], &["m"]), Arc::new(Touch), "both", "merged")
            .aggregate(aggregate("table", "m", dir.path().join("table.tsv")), "merged")
            .aggregate(aggregate("left_table", "l", dir.path().join("left.tsv")), "left")
            .build()
            .unwrap();

        let seeds: Vec<Tuple> = ["C", "A", "B"]
            .iter()
            .map(|k| {
                let artifacts: Artifacts = [("r", format!("{}.fq", k))].into_iter().collect();
                Tuple::new(SampleKey::from(*k), artifacts)
            })
            .collect();

        let report = graph.run(seeds, RunContext::new(dir.path().join("work"))).await.unwrap();
        assert_eq!(report.stages.len(), 3);
        assert_eq!(report.joins[0].emitted, 3);
        let table = std::fs::read_to_string(dir.path().join("table.tsv")).unwrap();
        assert_eq!(table, "A\tm\nB\tm\nC\tm\n");
        let left = std::fs::read_to_string(dir.path().join("left.tsv")).unwrap();
        assert_eq!(left, "A\tl\nB\tl\nC\tl\n");
    }

    #[tokio::test]
    async fn test_run_with_no_seeds_completes() {
        let dir = tempdir().unwrap();
        let graph = GraphBuilder::new()
            .source("src", &["r"])
            .stage(stage("a", &["r"], &["x"]), Arc::new(Touch), "src", "a")
            .aggregate(aggregate("t", "x", dir.path().join("t.tsv")), "a")
            .build()
            .unwrap();
        let report = graph.run(Vec::new(), RunContext::new(dir.path().join("work"))).await.unwrap();
        assert_eq!(report.aggregates[0].path, None);
    }

    #[tokio::test]
    async fn test_run_rejects_seed_without_source_artifacts() {
        let dir = tempdir().unwrap();
        let graph = GraphBuilder::new()
            .source("src", &["r1", "r2"])
            .stage(stage("a", &["r1"], &["x"]), Arc::new(Touch), "src", "a")
            .build()
            .unwrap();
        let artifacts: Artifacts = [("r1", "A_1.fq")].into_iter().collect();
        let seeds = vec![Tuple::new(SampleKey::from("A"), artifacts)];
        let result = graph.run(seeds, RunContext::new(dir.path().to_path_buf())).await;
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_run_rejects_seed_key_outside_work_dir() {
        let dir = tempdir().unwrap();
        let graph = GraphBuilder::new()
            .source("src", &["r"])
            .stage(stage("a", &["r"], &["x"]), Arc::new(Touch), "src", "a")
            .build()
            .unwrap();
        let peer = dir.path().join("work").join("a").join("B").join("B.x");
        std::fs::create_dir_all(peer.parent().unwrap()).unwrap();
        std::fs::write(&peer, "B\tx\n").unwrap();

        let seeds: Vec<Tuple> = ["A", ".."]
            .iter()
            .map(|k| {
                let artifacts: Artifacts = [("r", format!("{}.fq", k))].into_iter().collect();
                Tuple::new(SampleKey::from(*k), artifacts)
            })
            .collect();
        let result = graph.run(seeds, RunContext::new(dir.path().join("work"))).await;
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
        assert!(peer.exists());
    }

    #[tokio::test]
    async fn test_run_surfaces_aggregate_write_failure_after_all_nodes_finish() {
        let dir = tempdir().unwrap();
        let graph = GraphBuilder::new()
            .source("src", &["r"])
            .stage(stage("a", &["r"], &["x"]), Arc::new(Touch), "src", "a")
            .stage(stage("b", &["x"], &["y"]), Arc::new(Touch), "a", "b")
            .aggregate(aggregate("bad", "x", dir.path().join("no_such_dir").join("x.tsv")), "a")
            .aggregate(aggregate("good", "y", dir.path().join("y.tsv")), "b")
            .build()
            .unwrap();

        let seeds: Vec<Tuple> = ["B", "A"]
            .iter()
            .map(|k| {
                let artifacts: Artifacts = [("r", format!("{}.fq", k))].into_iter().collect();
                Tuple::new(SampleKey::from(*k), artifacts)
            })
            .collect();
        let work = dir.path().join("work");
        let result = graph.run(seeds, RunContext::new(work.clone())).await;

        match result {
            Err(PipelineError::AggregateWrite { name, path, .. }) => {
                assert_eq!(name, "bad");
                assert!(path.ends_with("no_such_dir/x.tsv"));
            }
            other => panic!("expected AggregateWrite, got {:?}", other),
        }
        let good = std::fs::read_to_string(dir.path().join("y.tsv")).unwrap();
        assert_eq!(good, "A\ty\nB\ty\n");
        assert!(work.join("b").join("A").join("A.y").exists());
        assert!(!dir.path().join("no_such_dir").exists());
    }
}
