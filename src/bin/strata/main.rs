use anyhow::{Context, Result};
use std::io::Write;
use std::rc::Rc;
use tracing::debug;

mod args;

use strata::commits::{collect_history, HistoryOptions};
use strata::hibernation::{scratch_dir, HibernationStore};
use strata::item::Facts;
use strata::pipeline::Pipeline;
use strata::plan::RunPlan;
use strata::planner::{build_plan, PlannerOptions};
use strata::progress::PlanProgress;
use strata::registry::Registry;
use strata::report::{write_binary_report, write_text_report, RunHeader, FORMAT_VERSION};
use strata::ticks::DEFAULT_TICK_SECS;

fn configure_tracing(verbose: u8, use_color: bool) -> Result<()> {
    use tracing_log::{AsLog, LogTracer};
    use tracing_subscriber::filter::LevelFilter;

    let filter = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    LogTracer::builder().with_max_level(filter.as_log()).init()?;

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn try_main(parsed: args::ParsedArgs, registry: Registry) -> Result<()> {
    let repo = git2::Repository::open(&parsed.repository)
        .map_err(strata::errors::Error::Repository)
        .with_context(|| format!("cannot open repository {:?}", parsed.repository))?;
    let head = repo.head().ok().and_then(|h| h.target());

    let history_options = HistoryOptions {
        first_parent: parsed.first_parent,
        head_only: parsed.head_only,
    };
    let commits = collect_history(&repo, history_options)?;
    debug!("{} commits collected", commits.len());

    let plan = build_plan(
        &commits,
        &PlannerOptions {
            traceback_merges: true,
            hibernation_distance: parsed.hibernation_distance,
        },
    );

    if parsed.dump_plan {
        dump_plan(&plan);
        return Ok(());
    }

    let selected: Vec<&str> = parsed.selected.iter().map(|s| s.as_str()).collect();
    let items = registry.resolve(&selected)?;

    let scratch = scratch_dir(parsed.cache_path.as_deref());
    let mut facts = Facts::new(commits);
    facts.repository_uri = parsed.repository.display().to_string();
    facts.repository = Some(Rc::new(repo));
    facts.head = head;
    facts.options = parsed.options;
    facts.workers = parsed.jobs;
    facts.scratch_dir = scratch.clone();

    let mut pipeline = Pipeline::new(items);
    if parsed.hibernation_disk {
        std::fs::create_dir_all(&scratch)
            .with_context(|| format!("cannot create scratch directory {scratch:?}"))?;
        pipeline.hibernate_with(HibernationStore::on_disk(scratch), false);
    }

    let show_progress = !parsed.quiet && console::Term::stderr().is_term();
    let mut bar = PlanProgress::new(plan.len() as u64 + 2, show_progress);
    pipeline.on_progress(Box::new(move |step, _total, label| {
        bar.step(step as u64, label);
        if label.is_empty() {
            bar.finish_with_message("analysed");
        }
    }));

    pipeline.initialise(facts)?;
    let outcome = pipeline.run(&plan)?;

    let tick_size_secs = pipeline
        .facts()
        .and_then(|f| f.clock)
        .map(|c| c.size_secs())
        .unwrap_or(DEFAULT_TICK_SECS);
    let header = RunHeader {
        repository: parsed.repository.display().to_string(),
        version: FORMAT_VERSION,
        vcs_hash: head.map(|h| h.to_string()).unwrap_or_default(),
        begin_tick: outcome.begin_tick,
        end_tick: outcome.end_tick,
        commit_count: outcome.commit_count,
        runtime_ms: outcome.elapsed.as_millis() as u64,
        tick_size_secs,
    };

    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    if parsed.binary_output {
        write_binary_report(&mut out, &header, &outcome.results)?;
    } else {
        write_text_report(&mut out, &header, &outcome.results)?;
    }
    out.flush()?;

    if outcome.cancelled {
        anyhow::bail!("run cancelled; the emitted report holds partial results");
    }
    Ok(())
}

/// The `--dump-plan` introspection path: print the linearised action plan
/// without configuring or running any analysis.
fn dump_plan(plan: &RunPlan) {
    for action in &plan.actions {
        println!("{:9} {:?}", action.label(), action.branches.as_slice());
    }
}

fn main() {
    let registry = Registry::builtin();
    let matches = args::command(&registry)
        .try_get_matches()
        .unwrap_or_else(|e| {
            // clap renders its own message; usage problems are configuration
            // errors.
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 2 } else { 0 });
        });

    let parsed = match args::parse(&registry, &matches) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.exit_code());
        }
    };

    let use_color = console::Term::stderr().is_term();
    console::set_colors_enabled(use_color);
    if let Err(e) = configure_tracing(parsed.verbose, use_color) {
        eprintln!("Error: failed to initialize logging: {e}");
        std::process::exit(1);
    }

    if let Err(e) = try_main(parsed, registry) {
        eprintln!("Error: {e:#}");
        let code = e
            .downcast_ref::<strata::errors::Error>()
            .map(|inner| inner.exit_code())
            .unwrap_or(1);
        std::process::exit(code);
    }
}
