use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tree_lattice::error::SolverError;
use tree_lattice::io::{read_newick_trees, read_species_mapping, write_matrix_tsv, write_newick};
use tree_lattice::{
    CladeSupport, ClusterSolver, Forest, PipelineSolver, SearchSpaceConfig, SequentialSolver, SolverConfig,
    SpeciesMapper, build_search_space,
};

/// Infer the best binary tree over the taxa of a set of observation trees,
/// searching the cluster lattice spanned by those trees.
#[derive(Parser, Debug)]
#[command(name = "tree-lattice", version, about = "Cluster-lattice DP tree search")]
struct Args {
    /// Observation trees: one newick per line, or NEXUS (optionally .gz)
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Output path for the resolved newick tree (`-` for stdout)
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Species mapping, one `species: ind1, ind2` line per species
    #[arg(short = 'a', long = "species")]
    species: Option<PathBuf>,

    /// Also write the species similarity matrix as TSV
    #[arg(long = "matrix-out")]
    matrix_out: Option<PathBuf>,

    /// Search strategy: sequential | pipeline
    #[arg(long = "strategy", value_enum, default_value_t = StrategyArg::Sequential)]
    strategy: StrategyArg,

    /// Search-space augmentation: 0 trees only, 1 similarity clusters, 2 ranked neighbours
    #[arg(short = 'x', long = "augmentation", default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
    augmentation: u8,

    /// Do not graft missing taxa into incomplete trees
    #[arg(long = "no-completion", default_value_t = false)]
    no_completion: bool,

    /// Seed of every random choice
    #[arg(short = 's', long = "seed", default_value_t = 0)]
    seed: u64,

    /// Worker threads of the pipeline strategy (default: available cores)
    #[arg(short = 't', long = "workers")]
    workers: Option<usize>,

    /// Candidate splits per pipeline work item
    #[arg(long = "batch-size", default_value_t = 32)]
    batch_size: usize,

    /// Quiet mode: only warnings and errors are logged
    #[arg(short = 'q', long = "quiet", default_value_t = false)]
    quiet: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StrategyArg {
    Sequential,
    Pipeline,
}

fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn run(args: &Args) -> Result<(), SolverError> {
    let t0 = Instant::now();
    let trees = read_newick_trees(&args.input)?;
    let forest = Forest::from_phylo_trees(&trees)?;
    info!(
        "Read {} trees over {} taxa in {:.3}s ({} incomplete)",
        forest.trees.len(),
        forest.taxon_count(),
        t0.elapsed().as_secs_f64(),
        forest.incomplete_count()
    );

    let species = match &args.species {
        Some(path) => {
            let pairs = read_species_mapping(path)?;
            let spm = SpeciesMapper::from_assignments(&forest.taxa, pairs.iter().map(|(t, s)| (t.as_str(), s.as_str())))?;
            info!("Mapped {} individuals to {} species", spm.taxon_count(), spm.species_count());
            Some(spm)
        }
        None => None,
    };

    let t1 = Instant::now();
    let space_config = SearchSpaceConfig {
        augmentation: args.augmentation,
        complete_trees: !args.no_completion,
        seed: args.seed,
        ..SearchSpaceConfig::default()
    };
    let mut built = build_search_space(&forest, species, &space_config)?;
    info!("Building search space {:.3}s: {} clusters", t1.elapsed().as_secs_f64(), built.space.cluster_count());

    if let Some(path) = &args.matrix_out {
        let names = match built.space.species() {
            Some(spm) => spm.species_names().names().to_vec(),
            None => forest.taxa.names().to_vec(),
        };
        write_matrix_tsv(path, &names, &built.species_matrix)?;
    }

    let mut solver_config = SolverConfig { batch_size: args.batch_size, seed: args.seed, ..SolverConfig::default() };
    if let Some(workers) = args.workers {
        solver_config.workers = workers;
    }
    let solver: Box<dyn ClusterSolver> = match args.strategy {
        StrategyArg::Sequential => Box::new(SequentialSolver::new(solver_config)),
        StrategyArg::Pipeline => Box::new(PipelineSolver::new(solver_config)),
    };

    let t2 = Instant::now();
    let model = CladeSupport::from_forest(&forest);
    let solution = solver.solve(&mut built.space, &model)?;
    info!("Solving {:.3}s: score {}", t2.elapsed().as_secs_f64(), solution.score);

    let t3 = Instant::now();
    write_newick(&args.output, &solution.tree.to_newick(&forest.taxa))?;
    info!("Writing to output {:.3}s", t3.elapsed().as_secs_f64());
    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.quiet);

    if let Err(e) = run(&args) {
        eprintln!("{e}");
        std::process::exit(2);
    }
}
