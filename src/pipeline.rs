//! Producer / worker pool / consumer strategy.
//!
//! ```text
//!   producer ──(batches of splits, bounded)──► workers ──(weights)──┐
//!      │                                                            ▼
//!      └──────────(one entry per cluster, post-order)──────────► consumer
//! ```
//!
//! The producer runs the structural search ([`Search`]) and, instead of scoring
//! a resolvable cluster, marks it pending and queues its viable candidate
//! splits. Splits are cut into fixed-size batches for the workers, which
//! compute weights through the shared [`WeightCache`]. The consumer takes the
//! queued clusters in order, waits for their weights and keeps the best split.
//! Entries arrive in post-order, so the sides of every candidate are already
//! scored when the consumer reaches it. A sentinel closes the queue.
//!
//! Equal scores are settled by a seeded random draw, since the candidate
//! order seen by the consumer is the only ordering left to bias the result.

use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::SolverError;
use crate::search::{Search, SplitScorer};
use crate::search_space::SearchSpace;
use crate::solver::{ClusterSolver, Solution, SolverConfig, TieBreak, TieBreaker, finish};
use crate::vertex::{Resolution, VertexArena, VertexId};
use crate::weights::{CostModel, Split, WeightCache};

/// The producer recurses once per lattice level.
const PRODUCER_STACK_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Producing,
    Draining,
    Done,
}

/// Splits sent to one worker, and where to answer.
struct Batch {
    offset: usize,
    splits: Vec<Split>,
    reply: Sender<BatchResult>,
}

struct BatchResult {
    offset: usize,
    /// Combined weight per split of the batch
    weights: Vec<f64>,
}

enum QueueEntry {
    /// A cluster whose score is already known
    Scored { vertex: VertexId, score: f64 },
    /// A cluster to score from its candidates once `batches` results arrived
    Internal {
        vertex: VertexId,
        candidates: Vec<(VertexId, VertexId)>,
        results: Receiver<BatchResult>,
        batches: usize,
    },
    Finished,
}

/// Producer side of the pipeline.
struct QueueScorer<'a> {
    model: &'a dyn CostModel,
    work: Sender<Batch>,
    entries: Sender<QueueEntry>,
    batch_size: usize,
    emitted: HashSet<VertexId>,
    closed: bool,
}

impl<'a> QueueScorer<'a> {
    fn new(model: &'a dyn CostModel, work: Sender<Batch>, entries: Sender<QueueEntry>, batch_size: usize) -> Self {
        QueueScorer { model, work, entries, batch_size: batch_size.max(1), emitted: HashSet::new(), closed: false }
    }

    fn emit(&mut self, entry: QueueEntry) {
        if self.entries.send(entry).is_err() {
            self.closed = true;
        }
    }

    /// Announces a side memoized before this run.
    fn emit_known(&mut self, arena: &VertexArena, v: VertexId) {
        if let Some(Resolution::Done(score)) = arena.vertex(v).resolution() {
            if self.emitted.insert(v) {
                self.emit(QueueEntry::Scored { vertex: v, score });
            }
        }
    }

    /// Sends the sentinel. Returns whether any queue closed early.
    fn finish(mut self) -> bool {
        self.emit(QueueEntry::Finished);
        self.closed
    }
}

impl SplitScorer for QueueScorer<'_> {
    fn base(&mut self, arena: &mut VertexArena, v: VertexId) -> Resolution {
        let score = self.model.base_score(arena.cluster(v));
        arena.mark_done(v, score, None, 0.0);
        self.emitted.insert(v);
        self.emit(QueueEntry::Scored { vertex: v, score });
        Resolution::Done(score)
    }

    fn resolve(&mut self, arena: &mut VertexArena, v: VertexId, candidates: Vec<(VertexId, VertexId)>) -> Resolution {
        for &(a, b) in &candidates {
            self.emit_known(arena, a);
            self.emit_known(arena, b);
        }
        arena.mark_pending(v);

        let (reply, results) = unbounded();
        let mut batches = 0;
        for (k, chunk) in candidates.chunks(self.batch_size).enumerate() {
            let splits = chunk
                .iter()
                .map(|&(a, b)| Split::new(arena.cluster(a).clone(), arena.cluster(b).clone()))
                .collect();
            let batch = Batch { offset: k * self.batch_size, splits, reply: reply.clone() };
            if self.work.send(batch).is_err() {
                self.closed = true;
            }
            batches += 1;
        }
        self.emitted.insert(v);
        self.emit(QueueEntry::Internal { vertex: v, candidates, results, batches });
        Resolution::Pending
    }
}

/// Worker loop: weights every split of every batch until the queue closes.
fn work(batches: Receiver<Batch>, model: &dyn CostModel, cache: &WeightCache) {
    for batch in batches.iter() {
        let weights = batch
            .splits
            .iter()
            .map(|split| model.combine(cache.get_or_compute(model, split), split))
            .collect();
        // The consumer may already have stopped; its results are not needed then
        let _ = batch.reply.send(BatchResult { offset: batch.offset, weights });
    }
}

/// Consumer's record of a scored cluster.
#[derive(Clone, Copy, Debug)]
struct Scored {
    score: f64,
    children: Option<(VertexId, VertexId)>,
    weight: f64,
}

/// Drains the resolution queue up to the sentinel.
fn consume(entries: &Receiver<QueueEntry>, tie: &mut TieBreaker) -> Result<HashMap<VertexId, Scored>, SolverError> {
    let mut table: HashMap<VertexId, Scored> = HashMap::new();
    loop {
        let entry = entries
            .recv()
            .map_err(|_| SolverError::Pipeline("resolution queue closed before the sentinel".to_string()))?;
        match entry {
            QueueEntry::Finished => return Ok(table),
            QueueEntry::Scored { vertex, score } => {
                table.insert(vertex, Scored { score, children: None, weight: 0.0 });
            }
            QueueEntry::Internal { vertex, candidates, results, batches } => {
                let mut weights = vec![0.0; candidates.len()];
                for _ in 0..batches {
                    let r = results
                        .recv()
                        .map_err(|_| SolverError::Pipeline("a weight batch was lost".to_string()))?;
                    weights[r.offset..r.offset + r.weights.len()].copy_from_slice(&r.weights);
                }

                let mut best: Option<Scored> = None;
                for (&(a, b), &w) in candidates.iter().zip(&weights) {
                    let (Some(left), Some(right)) = (table.get(&a), table.get(&b)) else {
                        return Err(SolverError::Invariant("candidate side queued after its parent"));
                    };
                    let score = left.score + right.score + w;
                    if tie.accepts(score, best.map(|s| s.score)) {
                        best = Some(Scored { score, children: Some((a, b)), weight: w });
                    }
                }
                if let Some(s) = best {
                    table.insert(vertex, s);
                }
            }
        }
    }
}

/// Multi-threaded strategy: structural search, weighting and scoring run
/// concurrently.
#[derive(Debug)]
pub struct PipelineSolver {
    config: SolverConfig,
    state: Mutex<PipelineState>,
}

impl Default for PipelineSolver {
    fn default() -> Self {
        PipelineSolver::new(SolverConfig::default())
    }
}

impl PipelineSolver {
    pub fn new(config: SolverConfig) -> Self {
        PipelineSolver { config, state: Mutex::new(PipelineState::Idle) }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    fn set_state(&self, next: PipelineState) {
        let mut state = self.state.lock();
        debug!("pipeline {:?} -> {:?}", *state, next);
        *state = next;
    }
}

impl ClusterSolver for PipelineSolver {
    fn solve(&self, space: &mut SearchSpace, model: &dyn CostModel) -> Result<Solution, SolverError> {
        let start = Instant::now();
        let config = &self.config;
        let cache = WeightCache::new();
        let root = space.root();
        let universe = space.universe();
        let (work_tx, work_rx) = bounded::<Batch>(config.queue_capacity.max(1));
        let (entry_tx, entry_rx) = unbounded::<QueueEntry>();

        self.set_state(PipelineState::Producing);
        let outcome = {
            let (arena, clusters, species) = space.parts_mut();
            thread::scope(|s| -> Result<_, SolverError> {
                let producer = thread::Builder::new()
                    .name("lattice-producer".to_string())
                    .stack_size(PRODUCER_STACK_SIZE)
                    .spawn_scoped(s, move || {
                        let scorer = QueueScorer::new(model, work_tx, entry_tx, config.batch_size);
                        let mut search = Search::new(config, universe, species, scorer);
                        let res = search.compute(arena, root, clusters);
                        self.set_state(PipelineState::Draining);
                        let closed = search.into_scorer().finish();
                        (res, closed)
                    })?;

                for _ in 0..config.workers.max(1) {
                    let batches = work_rx.clone();
                    let cache = &cache;
                    s.spawn(move || work(batches, model, cache));
                }
                drop(work_rx);

                let mut tie = TieBreaker::new(TieBreak::Random, config.seed);
                let consumed = consume(&entry_rx, &mut tie);
                drop(entry_rx);
                let produced = producer
                    .join()
                    .map_err(|_| SolverError::Pipeline("producer thread panicked".to_string()))?;
                Ok((produced, consumed))
            })
        };
        let settled = outcome.and_then(|((produced, closed), consumed)| {
            let table = consumed?;
            if closed {
                return Err(SolverError::Pipeline("a queue closed while the producer was running".to_string()));
            }
            Ok((produced, table))
        });
        let (produced, table) = match settled {
            Ok(settled) => settled,
            Err(e) => {
                // Pending vertices would otherwise block every later search
                let reset = space.arena_mut().reset_pending();
                debug!("pipeline run failed, {reset} pending clusters reset");
                self.set_state(PipelineState::Idle);
                return Err(e);
            }
        };

        let arena = space.arena_mut();
        for (&v, s) in &table {
            arena.mark_done(v, s.score, s.children, s.weight);
        }
        let res = match (table.get(&root), produced) {
            (Some(s), _) => Resolution::Done(s.score),
            // Memoized before this run, or unresolvable
            (None, other) => other,
        };
        info!(
            "pipeline search done in {:.3}s: {} clusters scored, {} split weights computed",
            start.elapsed().as_secs_f64(),
            table.len(),
            cache.evaluations()
        );
        self.set_state(PipelineState::Done);
        finish(arena, root, res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::forest::Forest;
    use crate::search_space::{SearchSpaceConfig, build_search_space};
    use crate::solver::SequentialSolver;
    use crate::taxa::SpeciesMapper;
    use crate::weights::{CladeSupport, FnCost};

    fn forest() -> Forest {
        Forest::from_newick_strs(&[
            "(((A,B),C),((D,E),(F,G)));",
            "((A,(B,C)),(D,(E,(F,G))));",
            "(((A,B),(C,D)),(E,(F,G)));",
            "((A,B),((C,D),E),(F,G));",
        ])
        .unwrap()
    }

    #[test]
    fn test_pipeline_matches_sequential() {
        let forest = forest();
        let model = CladeSupport::from_forest(&forest);
        let built = build_search_space(&forest, None, &SearchSpaceConfig::default()).unwrap();

        let mut seq_space = built.space.clone();
        let sequential = SequentialSolver::default().solve(&mut seq_space, &model).unwrap();

        for (batch_size, workers) in [(1, 1), (3, 2), (64, 4)] {
            let config = SolverConfig { batch_size, workers, queue_capacity: 2, ..SolverConfig::default() };
            let solver = PipelineSolver::new(config);
            assert_eq!(solver.state(), PipelineState::Idle);
            let mut space = built.space.clone();
            let piped = solver.solve(&mut space, &model).unwrap();
            assert_eq!(piped.score, sequential.score);
            assert_eq!(solver.state(), PipelineState::Done);
            assert_eq!(piped.tree.nodes().len(), 2 * forest.taxon_count() - 1);
        }
    }

    #[test]
    fn test_pipeline_on_memoized_space() {
        let forest = forest();
        let model = CladeSupport::from_forest(&forest);
        let mut space = build_search_space(&forest, None, &SearchSpaceConfig::default()).unwrap().space;
        let first = SequentialSolver::default().solve(&mut space, &model).unwrap();
        let again = PipelineSolver::default().solve(&mut space, &model).unwrap();
        assert_eq!(first.score, again.score);
    }

    #[test]
    fn test_pipeline_four_taxa() {
        let forest = Forest::from_newick_strs(&["((A,B),(C,D));"]).unwrap();
        let mut space = SearchSpace::new(4);
        for c in forest.trees[0].clusters() {
            space.add_bipartition(c.clone());
        }
        space.add_bipartition(Cluster::from_ids(4, [0, 3]));
        let ab = Cluster::from_ids(4, [0, 1]);
        let model = FnCost(move |s: &Split| if s.left == ab || s.right == ab { 4.0 } else { 1.0 });
        let solution = PipelineSolver::default().solve(&mut space, &model).unwrap();
        assert!(solution.tree.contains(&Cluster::from_ids(4, [0, 1])));
        assert!(solution.tree.contains(&Cluster::from_ids(4, [2, 3])));
        assert_eq!(solution.score, 6.0);
        assert_eq!(solution.tree.root().split_weight, 4.0);
    }

    #[test]
    fn test_sentinel_without_root_yields_empty_table() {
        let (tx, rx) = unbounded();
        tx.send(QueueEntry::Finished).unwrap();
        let mut tie = TieBreaker::new(TieBreak::Random, 1);
        assert!(consume(&rx, &mut tie).unwrap().is_empty());

        let (tx, rx) = unbounded::<QueueEntry>();
        drop(tx);
        assert!(matches!(consume(&rx, &mut tie), Err(SolverError::Pipeline(_))));
    }

    #[test]
    fn test_failed_run_resets_pending_clusters() {
        let forest = Forest::from_newick_strs(&["((A,B),(C,D));"]).unwrap();
        let model = CladeSupport::from_forest(&forest);
        let mut space = SearchSpace::new(4);
        for c in forest.trees[0].clusters() {
            space.add_bipartition(c.clone());
        }
        let mut fresh = space.clone();
        let ab = space.arena().find(&Cluster::from_ids(4, [0, 1])).unwrap();

        // A pending side that no entry ever scores
        space.arena_mut().mark_pending(ab);
        let solver = PipelineSolver::default();
        assert!(matches!(solver.solve(&mut space, &model), Err(SolverError::Invariant(_))));
        assert_eq!(solver.state(), PipelineState::Idle);
        assert_eq!(space.arena().vertex(ab).resolution(), None);
        assert_eq!(space.arena().vertex(space.root()).resolution(), None);

        let retried = solver.solve(&mut space, &model).unwrap();
        let expected = SequentialSolver::default().solve(&mut fresh, &model).unwrap();
        assert_eq!(retried.score, expected.score);
        assert!(retried.tree.contains(&Cluster::from_ids(4, [0, 1])));
    }

    #[test]
    fn test_pipeline_keeps_species_groups_whole() {
        let forest =
            Forest::from_newick_strs(&["((a1,a2),((b1,b2),(c1,d1)));", "((a1,(a2,b1)),(b2,(c1,d1)));"]).unwrap();
        let spm = SpeciesMapper::from_assignments(&forest.taxa, [("a1", "A"), ("a2", "A"), ("b1", "B"), ("b2", "B")])
            .unwrap();
        let model = CladeSupport::from_forest(&forest);
        let built = build_search_space(&forest, Some(spm), &SearchSpaceConfig::default()).unwrap();

        let sequential = SequentialSolver::default().solve(&mut built.space.clone(), &model).unwrap();
        for workers in [1, 3] {
            let config = SolverConfig { workers, batch_size: 2, ..SolverConfig::default() };
            let piped = PipelineSolver::new(config).solve(&mut built.space.clone(), &model).unwrap();
            assert_eq!(piped.score, sequential.score);
            assert_eq!(piped.score, 9.0);
            for members in [[0, 1], [2, 3]] {
                let cluster = Cluster::from_ids(6, members);
                let node = piped.tree.nodes().iter().find(|n| n.cluster == cluster).unwrap();
                assert_eq!(node.children, None);
            }
        }
    }
}
