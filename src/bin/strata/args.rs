use clap::{crate_description, crate_version, Arg, ArgAction, ArgMatches, Command};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use strata::errors::{Error, Result};
use strata::item::OptionValue;
use strata::registry::Registry;
use strata::ticks;

/// Static argument ids; registry-driven options never shadow these.
const STATIC_IDS: &[&str] = &[
    "repository",
    "cache-path",
    "pb",
    "quiet",
    "verbose",
    "first-parent",
    "head",
    "tick-size",
    "jobs",
    "hibernation-distance",
    "lines-hibernation-threshold",
    "lines-hibernation-disk",
    "dump-plan",
];

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

// -----------------------------------------------------------------------------
// command assembly
// -----------------------------------------------------------------------------
/// Build the command line: the static surface plus one `--<flag>` per
/// registered analysis and one `--<option>` per registered item option.
pub fn command(registry: &Registry) -> Command {
    let mut command = Command::new("strata")
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("repository")
                .value_name("REPOSITORY")
                .required(true)
                .help("Path to the Git repository to analyse"),
        )
        .arg(
            Arg::new("cache-path")
                .value_name("CACHE_PATH")
                .help("Scratch directory; supersedes XDG_CACHE_HOME and TMPDIR"),
        )
        .arg(
            Arg::new("pb")
                .long("pb")
                .action(ArgAction::SetTrue)
                .help("Emit the binary record stream on stdout instead of text"),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .short('q')
                .action(ArgAction::SetTrue)
                .help("Suppress progress output"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("Raise log verbosity; can be repeated"),
        )
        .arg(
            Arg::new("first-parent")
                .long("first-parent")
                .action(ArgAction::SetTrue)
                .help("Linearise the history by first parent only"),
        )
        .arg(
            Arg::new("head")
                .long("head")
                .action(ArgAction::SetTrue)
                .help("Analyse only the HEAD commit"),
        )
        .arg(
            Arg::new("tick-size")
                .long("tick-size")
                .value_name("DURATION")
                .help("Tick granularity: 30m, 12h, 1d, 1w, or seconds"),
        )
        .arg(
            Arg::new("jobs")
                .long("jobs")
                .short('j')
                .value_name("N")
                .help("Upper bound on intra-commit parallelism"),
        )
        .arg(
            Arg::new("hibernation-distance")
                .long("hibernation-distance")
                .value_name("N")
                .help("Spill branches idle for more than N plan actions"),
        )
        .arg(
            Arg::new("lines-hibernation-threshold")
                .long("lines-hibernation-threshold")
                .value_name("N")
                .help("Minimum live lines before line state is spilled"),
        )
        .arg(
            Arg::new("lines-hibernation-disk")
                .long("lines-hibernation-disk")
                .action(ArgAction::SetTrue)
                .help("Spill hibernated state to disk instead of memory"),
        )
        .arg(
            Arg::new("dump-plan")
                .long("dump-plan")
                .action(ArgAction::SetTrue)
                .help("Print the linearised action plan and exit"),
        );

    let statics: HashSet<&str> = STATIC_IDS.iter().copied().collect();
    for leaf in registry.get_leaves() {
        let flag = leaf.flag.expect("leaves carry flags");
        command = command.arg(
            Arg::new(flag)
                .long(flag)
                .action(ArgAction::SetTrue)
                .help(leaf.description)
                .help_heading("Analyses"),
        );
    }
    for name in registry.get_leaves().iter().map(|r| r.name).collect::<Vec<_>>() {
        let registration = registry.get(name).expect("leaf is registered");
        for option in &registration.options {
            if statics.contains(option.name) {
                continue;
            }
            command = command.arg(option_arg(option));
        }
    }
    // Plumbing options surface too; they are reachable from every analysis.
    for name in ["tree_changes", "line_history", "ticks", "identity"] {
        if let Some(registration) = registry.get(name) {
            for option in &registration.options {
                if statics.contains(option.name) {
                    continue;
                }
                command = command.arg(option_arg(option));
            }
        }
    }
    command
}

fn option_arg(option: &strata::item::ItemOption) -> Arg {
    let arg = Arg::new(option.name)
        .long(option.name)
        .help(option.help)
        .help_heading("Analysis Options");
    match option.default {
        OptionValue::Bool(_) => arg.action(ArgAction::SetTrue),
        OptionValue::Int(_) => arg.value_name("N"),
        OptionValue::Text(_) => arg.value_name("VALUE"),
    }
}

// -----------------------------------------------------------------------------
// parsed form
// -----------------------------------------------------------------------------
#[derive(Debug)]
pub struct ParsedArgs {
    pub repository: PathBuf,
    pub cache_path: Option<PathBuf>,
    pub binary_output: bool,
    pub quiet: bool,
    pub verbose: u8,
    pub first_parent: bool,
    pub head_only: bool,
    pub jobs: usize,
    pub hibernation_distance: Option<usize>,
    pub hibernation_disk: bool,
    pub dump_plan: bool,
    /// Names of the selected leaf analyses.
    pub selected: Vec<String>,
    /// Item options, forwarded through the facts.
    pub options: BTreeMap<String, OptionValue>,
}

fn parse_usize(matches: &ArgMatches, id: &str) -> Result<Option<usize>> {
    match matches.get_one::<String>(id) {
        None => Ok(None),
        Some(text) => text
            .parse::<usize>()
            .map(Some)
            .map_err(|_| Error::config(format!("--{id} expects a non-negative integer, got `{text}`"))),
    }
}

pub fn parse(registry: &Registry, matches: &ArgMatches) -> Result<ParsedArgs> {
    let mut options: BTreeMap<String, OptionValue> = BTreeMap::new();

    if let Some(duration) = matches.get_one::<String>("tick-size") {
        options.insert(
            "tick-size".to_string(),
            OptionValue::Int(ticks::parse_duration(duration)?),
        );
    }
    if let Some(threshold) = parse_usize(matches, "lines-hibernation-threshold")? {
        options.insert(
            "lines-hibernation-threshold".to_string(),
            OptionValue::Int(threshold as i64),
        );
    }

    let dump_plan = matches.get_flag("dump-plan");
    let mut selected = Vec::new();
    for leaf in registry.get_leaves() {
        let flag = leaf.flag.expect("leaves carry flags");
        if matches.get_flag(flag) {
            selected.push(leaf.name.to_string());
        }
    }
    if selected.is_empty() && !dump_plan {
        return Err(Error::config(
            "no analyses selected; pass at least one analysis flag (for example --burndown)",
        ));
    }

    for name in [
        "tree_changes",
        "line_history",
        "ticks",
        "identity",
        "burndown",
        "devs",
        "couples",
        "file_history",
        "shotness",
        "typos",
    ] {
        let registration = match registry.get(name) {
            Some(r) => r,
            None => continue,
        };
        for option in &registration.options {
            if options.contains_key(option.name) {
                continue;
            }
            match option.default {
                OptionValue::Bool(_) => {
                    if matches.get_flag(option.name) {
                        options.insert(option.name.to_string(), OptionValue::Bool(true));
                    }
                }
                OptionValue::Int(_) => {
                    if let Some(text) = matches.get_one::<String>(option.name) {
                        let value = text.parse::<i64>().map_err(|_| {
                            Error::config(format!(
                                "--{} expects an integer, got `{text}`",
                                option.name
                            ))
                        })?;
                        options.insert(option.name.to_string(), OptionValue::Int(value));
                    }
                }
                OptionValue::Text(_) => {
                    if let Some(text) = matches.get_one::<String>(option.name) {
                        options.insert(option.name.to_string(), OptionValue::Text(text.clone()));
                    }
                }
            }
        }
    }

    Ok(ParsedArgs {
        repository: PathBuf::from(
            matches
                .get_one::<String>("repository")
                .expect("repository is required"),
        ),
        cache_path: matches.get_one::<String>("cache-path").map(PathBuf::from),
        binary_output: matches.get_flag("pb"),
        quiet: matches.get_flag("quiet"),
        verbose: matches.get_count("verbose"),
        first_parent: matches.get_flag("first-parent"),
        head_only: matches.get_flag("head"),
        jobs: parse_usize(matches, "jobs")?.unwrap_or_else(default_jobs).max(1),
        hibernation_distance: parse_usize(matches, "hibernation-distance")?,
        hibernation_disk: matches.get_flag("lines-hibernation-disk"),
        dump_plan,
        selected,
        options,
    })
}
