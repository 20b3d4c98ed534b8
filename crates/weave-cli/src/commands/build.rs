//! `weave build` command implementation.

use super::{print_human, print_json, BuildResultJson, ErrorJson, ProjectOptions};
use miette::Result;
use std::sync::Arc;
use weave_core::{BuildContext, Bundler};

/// Run one build and write its artifacts.
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

    let mut bundler = Bundler::new(Arc::clone(&ctx));
    let mut outcome = bundler.build();
    let written = match bundler.write(&outcome) {
        Ok(written) => written,
        Err(e) => {
            outcome.errors.push(e);
            Vec::new()
        }
    };
    ctx.shutdown();

    let root = &ctx.config().root;
    if json {
        print_json(&BuildResultJson::new(&outcome, &written, root))?;
    } else {
        print_human(&outcome, &written, root);
    }

    if outcome.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
