//! `weave watch` command implementation.
//!
//! Runs the initial build, then rebuilds on every change until Ctrl-C. With
//! `--json` one result object is printed per finished build (JSON lines).

use super::{print_human, print_json, BuildResultJson, ErrorJson, ProjectOptions};
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};
use weave_core::{write_artifacts, BuildContext, Bundler, WatchSession, WatchState, WatchSummary};

#[derive(Serialize)]
struct WatchSummaryJson {
    ok: bool,
    builds: u64,
    published: u64,
    superseded: u64,
    failed: u64,
}

impl From<WatchSummary> for WatchSummaryJson {
    fn from(s: WatchSummary) -> Self {
        Self {
            ok: true,
            builds: s.builds,
            published: s.published,
            superseded: s.superseded,
            failed: s.failed,
        }
    }
}

/// Run the watch command.
pub fn run(options: &ProjectOptions, json: bool) -> Result<()> {
    let ctx = match options.load_config().and_then(BuildContext::init) {
        Ok(ctx) => ctx,
        Err(e) => {
            if json {
                print_json(&BuildResultJson::failed(ErrorJson::from_configuration(&e)))?;
            } else {
                eprintln!("error[{}]: {e}", e.code());
            }
            std::process::exit(1);
        }
    };

    let config = ctx.config().clone();
    ctx.on_artifacts_ready(move |outcome| {
        let mut outcome = outcome.clone();
        let written = match write_artifacts(&config.out_dir, &outcome.artifacts, config.clean) {
            Ok(written) => written,
            Err(e) => {
                error!(code = e.code(), "{e}");
                outcome.errors.push(e);
                Vec::new()
            }
        };
        if json {
            if let Err(e) = print_json(&BuildResultJson::new(&outcome, &written, &config.root)) {
                error!("{e}");
            }
        } else {
            print_human(&outcome, &written, &config.root);
        }
    });

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    let summary = runtime.block_on(watch(Arc::clone(&ctx), json))?;
    ctx.shutdown();

    if json {
        print_json(&WatchSummaryJson::from(summary))?;
    } else {
        println!(
            "Stopped after {} builds ({} published, {} superseded, {} failed)",
            summary.builds, summary.published, summary.superseded, summary.failed
        );
    }
    Ok(())
}

async fn watch(ctx: Arc<BuildContext>, json: bool) -> Result<WatchSummary> {
    let session = WatchSession::start(Bundler::new(ctx)).map_err(|e| miette::miette!("{e}"))?;

    // Failed builds never reach the artifact listeners; report them here.
    let mut state = session.state();
    let reporter = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            if let WatchState::Failed { generation, errors } = current {
                if json {
                    let _ = print_json(&FailedBuildJson {
                        ok: false,
                        generation,
                        error_count: errors,
                    });
                } else {
                    eprintln!("Build {generation} failed with {errors} error(s)");
                }
            }
        }
    });

    if !json {
        println!("Watching for changes (Ctrl-C to stop)");
    }
    tokio::signal::ctrl_c().await.into_diagnostic()?;
    info!("stopping watch");

    let summary = session.stop().await;
    reporter.abort();
    Ok(summary)
}

#[derive(Serialize)]
struct FailedBuildJson {
    ok: bool,
    generation: u64,
    error_count: usize,
}
