#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

// ========================================================================================
//
//                            THE COMMAND LINE OF SETWORK
//
// ========================================================================================
//
// Loads the binary matrices named on the command line into one feature store, builds a
// validated search configuration from a TOML file and flag overrides, and dispatches to
// the engine. Every subcommand writes its results as TOML and nothing else.

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use rand::SeedableRng;
use rand::rngs::StdRng;
use setwork::config::{MinimumPerformance, PriorsConfig, SearchConfig};
use setwork::crossval::{consensus, run_cross_validation};
use setwork::pairwise;
use setwork::priors::{Priors, PriorsMode};
use setwork::progress::{SearchProgressObserver, SearchProgressStage};
use setwork::results::{FoldResult, SearchResult, load_toml, save_toml};
use setwork::search::Search;
use setwork::store::{FeatureStore, load_binary_matrix};
use setwork::types::FeatureId;
use setwork::validate::{SetworkList, ValidationResult, validate_setworks};
use std::error::Error;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Args, Clone)]
struct DataArgs {
    /// Binary matrix given as PATH or PATH=TYPE (repeatable). TYPE defaults to the
    /// file stem.
    #[arg(long = "data", value_name = "PATH[=TYPE]", required = true)]
    data: Vec<String>,

    /// Matrix whose features are the phenotypes, as PATH or PATH=TYPE
    #[arg(long, value_name = "PATH[=TYPE]")]
    phenotype_data: Option<String>,

    /// Cell value read as missing
    #[arg(long, default_value = "NA")]
    na_token: String,

    /// Drop features with fewer positive calls than this
    #[arg(long, default_value_t = 0)]
    feature_min: usize,
}

#[derive(Args, Clone, Default)]
struct ConfigArgs {
    /// TOML search configuration; flags below override its values
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long)]
    trials: Option<usize>,

    #[arg(long)]
    repopulate_frequency: Option<usize>,

    #[arg(long)]
    percent_to_repopulate: Option<f64>,

    /// Maximum union, intersection and difference sizes, e.g. 3,2,1
    #[arg(long, value_name = "U,I,D")]
    set_limits: Option<String>,

    /// BH, BY, bonferroni, holm, hochberg, hommel, qvalue or none
    #[arg(long)]
    correction: Option<String>,

    #[arg(long)]
    fdr: Option<f64>,

    #[arg(long)]
    rank_method: Option<String>,

    /// Cutoffs such as "sens=0.8 spec=0.7"
    #[arg(long)]
    minimum_performance: Option<String>,

    #[arg(long)]
    eject_fraction: Option<f64>,

    /// Turn passenger ejection off
    #[arg(long, conflicts_with = "eject_fraction")]
    no_eject: bool,

    /// Allow several thresholded variants of one feature per setwork
    #[arg(long)]
    bandwidth: bool,

    /// Reject mutually exclusive setworks
    #[arg(long)]
    force_cooccurring: bool,

    /// Priors file with union, intersection and difference records
    #[arg(long, value_name = "PATH")]
    priors: Option<PathBuf>,

    /// strict, weighted or stochastic
    #[arg(long, requires = "priors")]
    priors_mode: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    /// Shuffle the phenotype before searching, as a null test
    #[arg(long)]
    permute_phenotype: bool,

    #[arg(long)]
    node: Option<usize>,

    #[arg(long)]
    total_nodes: Option<usize>,

    /// Held-out labels per cross-validation fold
    #[arg(long)]
    fold_size: Option<usize>,

    /// 90, 95 or 99
    #[arg(long)]
    confidence_level: Option<String>,
}

#[derive(Parser)]
#[command(
    name = "setwork",
    about = "Stochastic search for Boolean combinations of binary features associated with a phenotype"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Search setworks for this node's share of phenotypes
    #[command(about = "Search setworks (outputs: <phenotype>.setworks.toml)")]
    Search {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        config: ConfigArgs,
        /// Directory for result files
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// Cross-validate the search for one phenotype
    #[command(about = "Run this node's folds (outputs: <phenotype>.fold<k>.toml)")]
    Crossval {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        config: ConfigArgs,
        /// Phenotype feature key; may be omitted when there is only one
        #[arg(long)]
        phenotype: Option<String>,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// Intersect fold results and vote on the held-out labels
    #[command(about = "Strict consensus of fold results (outputs: <phenotype>.consensus.toml)")]
    Consensus {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        phenotype: Option<String>,
        /// Fold result files written by `crossval`
        #[arg(required = true)]
        folds: Vec<PathBuf>,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// Test single markers against phenotypes, or against each other
    #[command(about = "Pairwise tests (outputs: pairwise*.toml)")]
    Pairwise {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        config: ConfigArgs,
        /// Test marker pairs instead of markers against phenotypes
        #[arg(long)]
        unsupervised: bool,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },

    /// Re-evaluate a list of setworks on new data
    #[command(about = "Validate setworks (outputs: validation.toml)")]
    Validate {
        #[command(flatten)]
        data: DataArgs,
        /// TOML file with [[setworks]] tables
        setworks: PathBuf,
        #[arg(long)]
        confidence_level: Option<String>,
        #[arg(long, default_value = "validation.toml")]
        output: PathBuf,
    },

    /// Turn the setworks of a search result into a priors file
    #[command(about = "Write a priors file from a search result")]
    MakePriors {
        result: PathBuf,
        #[arg(long, default_value = "priors.txt")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Search { data, config, out }) => run_search(data, config, out),
        Some(Commands::Crossval {
            data,
            config,
            phenotype,
            out,
        }) => run_crossval(data, config, phenotype, out),
        Some(Commands::Consensus {
            data,
            config,
            phenotype,
            folds,
            out,
        }) => run_consensus(data, config, phenotype, folds, out),
        Some(Commands::Pairwise {
            data,
            config,
            unsupervised,
            out,
        }) => run_pairwise(data, config, unsupervised, out),
        Some(Commands::Validate {
            data,
            setworks,
            confidence_level,
            output,
        }) => run_validate(data, setworks, confidence_level, output),
        Some(Commands::MakePriors { result, output }) => run_make_priors(result, output),
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
                process::exit(1);
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

// ========================================================================================
//                                  Input and configuration
// ========================================================================================

/// Splits `PATH=TYPE`, falling back to the file stem for the type.
fn parse_data_spec(spec: &str) -> (PathBuf, String) {
    match spec.rsplit_once('=') {
        Some((path, data_type)) if !data_type.is_empty() => {
            (PathBuf::from(path), data_type.to_string())
        }
        _ => {
            let path = PathBuf::from(spec.trim_end_matches('='));
            let data_type = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            (path, data_type)
        }
    }
}

fn load_store(args: &DataArgs) -> Result<(FeatureStore, Vec<String>), Box<dyn Error>> {
    let mut matrices = Vec::with_capacity(args.data.len() + 1);
    let mut inputs = Vec::with_capacity(args.data.len() + 1);
    let mut phenotype_type = None;

    let specs = args
        .data
        .iter()
        .map(|s| (s, false))
        .chain(args.phenotype_data.iter().map(|s| (s, true)));
    for (spec, is_phenotype) in specs {
        let (path, data_type) = parse_data_spec(spec);
        let matrix = load_binary_matrix(&path, &data_type, &args.na_token)?;
        if is_phenotype {
            phenotype_type = Some(matrix.data_type.clone());
        }
        inputs.push(format!("{}={}", path.display(), data_type));
        matrices.push(matrix);
    }

    let store = FeatureStore::from_matrices(&matrices, phenotype_type.as_deref(), args.feature_min)?;
    Ok((store, inputs))
}

fn build_config(args: &ConfigArgs) -> Result<SearchConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => SearchConfig::load(path)?,
        None => SearchConfig::default(),
    };

    let opt = &mut config.optimization;
    if let Some(trials) = args.trials {
        opt.trials = trials;
    }
    if let Some(frequency) = args.repopulate_frequency {
        opt.repopulate_frequency = frequency;
    }
    if let Some(percent) = args.percent_to_repopulate {
        opt.percent_to_repopulate = percent;
    }

    if let Some(limits) = &args.set_limits {
        let sizes = limits
            .split(',')
            .map(|s| s.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid --set-limits '{limits}': {e}"))?;
        let [union, intersection, difference] = sizes[..] else {
            return Err(format!("--set-limits needs three sizes, got '{limits}'").into());
        };
        config.set_limits.union = union;
        config.set_limits.intersection = intersection;
        config.set_limits.difference = difference;
    }

    if let Some(method) = &args.correction {
        config.correction = method.parse()?;
    }
    if let Some(fdr) = args.fdr {
        config.fdr = fdr;
    }
    if let Some(method) = &args.rank_method {
        config.rank_method = method.parse()?;
    }
    if let Some(spec) = &args.minimum_performance {
        config.minimum_performance = spec.parse::<MinimumPerformance>()?;
    }
    if args.no_eject {
        config.eject_fraction = None;
    } else if let Some(fraction) = args.eject_fraction {
        config.eject_fraction = Some(fraction);
    }
    config.bandwidth |= args.bandwidth;
    config.force_cooccurring |= args.force_cooccurring;
    config.permute_phenotype |= args.permute_phenotype;

    if let Some(path) = &args.priors {
        let mode = match &args.priors_mode {
            Some(mode) => mode.parse::<PriorsMode>()?,
            None => PriorsMode::default(),
        };
        config.priors = Some(PriorsConfig {
            mode,
            features: Priors::load(path)?,
        });
    }

    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(node) = args.node {
        config.multi_process.node = node;
    }
    if let Some(total) = args.total_nodes {
        config.multi_process.total_nodes = total;
    }
    if let Some(size) = args.fold_size {
        config.fold_size = Some(size);
    }
    if let Some(level) = &args.confidence_level {
        config.confidence_level = level.parse()?;
    }

    config.validate()?;
    Ok(config)
}

fn select_phenotype(store: &FeatureStore, name: Option<&str>) -> Result<FeatureId, Box<dyn Error>> {
    match name {
        Some(name) => store
            .phenotypes()
            .iter()
            .copied()
            .find(|&id| store.feature_name(id) == name)
            .ok_or_else(|| format!("'{name}' is not a phenotype of the loaded data").into()),
        None => match store.phenotypes() {
            [only] => Ok(*only),
            [] => Err("No phenotypes loaded; pass --phenotype-data".into()),
            many => Err(format!(
                "{} phenotypes loaded; choose one with --phenotype",
                many.len()
            )
            .into()),
        },
    }
}

/// A file name fragment safe on every platform.
fn file_stem_for(feature: &str) -> String {
    feature
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

fn ensure_dir(dir: &Path) -> Result<(), Box<dyn Error>> {
    fs::create_dir_all(dir)?;
    Ok(())
}

// ========================================================================================
//                                       Progress
// ========================================================================================

/// Draws one bar per search stage on a terminal and nothing otherwise.
struct ConsoleProgress {
    bar: Option<ProgressBar>,
}

impl ConsoleProgress {
    fn new() -> Self {
        Self { bar: None }
    }
}

impl SearchProgressObserver for ConsoleProgress {
    fn on_stage_start(&mut self, stage: SearchProgressStage, total: usize) {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(10)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(total as u64), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        bar.set_message(stage.describe());
        self.bar = Some(bar);
    }

    fn on_trial_finish(&mut self, completed: usize, retained: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(completed as u64);
            bar.set_message(format!("{retained} setworks held"));
        }
    }

    fn on_stage_finish(&mut self, stage: SearchProgressStage) {
        let _ = stage;
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

// ========================================================================================
//                                      Subcommands
// ========================================================================================

fn run_search(data: DataArgs, config: ConfigArgs, out: PathBuf) -> Result<(), Box<dyn Error>> {
    let config = build_config(&config)?;
    let (store, inputs) = load_store(&data)?;
    let search = Search::new(&store, &config)?;
    ensure_dir(&out)?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut progress = ConsoleProgress::new();
    let phenotypes: Vec<FeatureId> = config
        .multi_process
        .share(store.phenotypes())
        .map(|(_, &id)| id)
        .collect();
    if phenotypes.is_empty() {
        log::warn!(
            "Node {} of {} owns no phenotypes",
            config.multi_process.node,
            config.multi_process.total_nodes
        );
    }

    for phenotype in phenotypes {
        let outcome = search.run_with_observer(phenotype, &mut rng, &mut progress);
        let result = SearchResult::from_outcome(&search, &outcome, &inputs);
        let path = out.join(format!(
            "{}.setworks.toml",
            file_stem_for(store.feature_name(phenotype))
        ));
        save_toml(&result, &path)?;
        println!(
            "{} setworks for '{}' written to {}",
            result.entries.len(),
            store.feature_name(phenotype),
            path.display()
        );
    }
    Ok(())
}

fn run_crossval(
    data: DataArgs,
    config: ConfigArgs,
    phenotype: Option<String>,
    out: PathBuf,
) -> Result<(), Box<dyn Error>> {
    let config = build_config(&config)?;
    if config.fold_size.is_none() {
        return Err("crossval needs --fold-size or fold_size in the configuration".into());
    }
    let (store, inputs) = load_store(&data)?;
    let phenotype = select_phenotype(&store, phenotype.as_deref())?;
    ensure_dir(&out)?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut progress = ConsoleProgress::new();
    let folds = run_cross_validation(&store, &config, phenotype, &inputs, &mut rng, &mut progress)?;

    let stem = file_stem_for(store.feature_name(phenotype));
    for fold in &folds {
        let path = out.join(format!("{stem}.fold{}.toml", fold.fold));
        save_toml(fold, &path)?;
        println!(
            "Fold {} of {}: {} setworks written to {}",
            fold.fold + 1,
            fold.total_folds,
            fold.entries.len(),
            path.display()
        );
    }
    Ok(())
}

fn run_consensus(
    data: DataArgs,
    config: ConfigArgs,
    phenotype: Option<String>,
    fold_paths: Vec<PathBuf>,
    out: PathBuf,
) -> Result<(), Box<dyn Error>> {
    let config = build_config(&config)?;
    let (store, inputs) = load_store(&data)?;
    let phenotype = select_phenotype(&store, phenotype.as_deref())?;
    ensure_dir(&out)?;

    let folds = fold_paths
        .iter()
        .map(|path| load_toml::<FoldResult>(path))
        .collect::<Result<Vec<_>, _>>()?;
    let result = consensus(&folds, &store, phenotype, &config, &inputs);

    let path = out.join(format!(
        "{}.consensus.toml",
        file_stem_for(store.feature_name(phenotype))
    ));
    save_toml(&result, &path)?;

    let vote = &result.vote;
    println!(
        "{} setworks selected in all {} folds written to {}",
        result.entries.len(),
        result.folds,
        path.display()
    );
    println!(
        "Vote: {} labels predicted, {} omitted; sensitivity {:.3}, specificity {:.3}, PPV {:.3}, NPV {:.3}",
        vote.predicted_labels,
        vote.omitted_labels,
        vote.performance.sensitivity,
        vote.performance.specificity,
        vote.performance.ppv,
        vote.performance.npv
    );
    Ok(())
}

fn run_pairwise(
    data: DataArgs,
    config: ConfigArgs,
    unsupervised: bool,
    out: PathBuf,
) -> Result<(), Box<dyn Error>> {
    let config = build_config(&config)?;
    let (store, inputs) = load_store(&data)?;
    ensure_dir(&out)?;

    if unsupervised {
        let result = pairwise::unsupervised(&store, &config, &inputs);
        let path = out.join("pairwise.toml");
        save_toml(&result, &path)?;
        println!(
            "{} of {} marker pairs written to {}",
            result.entries.len(),
            result.tests,
            path.display()
        );
        return Ok(());
    }

    if store.phenotypes().is_empty() {
        return Err("Supervised pairwise tests need --phenotype-data".into());
    }
    for result in pairwise::supervised(&store, &config, &inputs) {
        let name = result.phenotype.as_deref().unwrap_or_default();
        let path = out.join(format!("{}.pairwise.toml", file_stem_for(name)));
        save_toml(&result, &path)?;
        println!(
            "{} of {} markers for '{}' written to {}",
            result.entries.len(),
            result.tests,
            name,
            path.display()
        );
    }
    Ok(())
}

fn run_validate(
    data: DataArgs,
    setworks: PathBuf,
    confidence_level: Option<String>,
    output: PathBuf,
) -> Result<(), Box<dyn Error>> {
    let (store, inputs) = load_store(&data)?;
    if store.phenotypes().is_empty() {
        return Err("Validation needs --phenotype-data".into());
    }
    let level = match confidence_level {
        Some(level) => level.parse()?,
        None => Default::default(),
    };
    let list: SetworkList = load_toml(&setworks)?;
    let records = validate_setworks(&store, &list.setworks, level);
    let result = ValidationResult {
        inputs,
        label_count: store.n_labels(),
        records,
    };
    save_toml(&result, &output)?;
    println!(
        "{} validation records written to {}",
        result.records.len(),
        output.display()
    );
    Ok(())
}

fn run_make_priors(result: PathBuf, output: PathBuf) -> Result<(), Box<dyn Error>> {
    let search_result: SearchResult = load_toml(&result)?;
    let priors = Priors::from_results(&search_result);
    if priors.is_empty() {
        log::warn!("{} holds no setworks; the priors file is empty", result.display());
    }
    priors.save(&output)?;
    println!("Priors written to {}", output.display());
    Ok(())
}
