mod backend;
mod config;
mod debug_log;
mod driver;
mod error;
mod phases;
mod rlm;
mod runner;
mod skills;
mod types;
mod ui_sink;

use std::sync::Arc;

use anyhow::Context;

use config::RunConfig;
use debug_log::DebugLog;
use ui_sink::{DebugUiSink, NullUiSink, UiSink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg = match RunConfig::parse_args(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let debug_log = if cfg.debug {
        DebugLog::enabled_in(&cfg.target).context("failed to open debug log")?
    } else {
        DebugLog::disabled()
    };

    // SIGINT/SIGTERM both map to the documented 130 user-interrupt exit
    // code via a process-wide signal listener, since this binary has no
    // TUI event loop of its own to intercept an abort keypress.
    let interrupted = Arc::new(tokio::sync::Notify::new());
    {
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            log::warn!("received interrupt signal, shutting down");
            interrupted.notify_waiters();
        });
    }

    let ui_sink: Box<dyn UiSink> = if cfg.debug {
        Box::new(DebugUiSink { log: debug_log.clone() })
    } else {
        Box::new(NullUiSink)
    };

    let run = async {
        if cfg.rlm {
            run_rlm(&cfg).await
        } else {
            runner::run(&cfg, ui_sink.as_ref()).await.map_err(anyhow::Error::from)
        }
    };

    let exit_code = tokio::select! {
        result = run => {
            match result {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("error: {e:#}");
                    1
                }
            }
        }
        _ = interrupted.notified() => 130,
    };

    std::process::exit(exit_code);
}

async fn run_rlm(cfg: &RunConfig) -> anyhow::Result<i32> {
    let changed_files = cfg.pr.map(|_| Vec::new());
    let repo = rlm::runner::load_codebase(&cfg.target, changed_files)
        .context("failed to load codebase for RLM run")?;

    // `--max-iterations` defaults to 5 (the runner's budget); RLM's own
    // default is 50. If the caller left it at the runner default we
    // assume they didn't intend to cap the RLM loop at 5.
    let max_iterations = if cfg.max_iterations == config::DEFAULT_MAX_ITERATIONS {
        config::DEFAULT_RLM_MAX_ITERATIONS
    } else {
        cfg.max_iterations
    };
    let rlm_cfg = rlm::runner::RlmConfig {
        max_iterations,
        backend: cfg.backend,
        ..rlm::runner::RlmConfig::default()
    };

    let question = cfg.question.clone().unwrap_or_else(|| config::DEFAULT_RLM_QUESTION.to_string());
    let runner = rlm::runner::RlmRunner::new(rlm_cfg, repo, cfg.target.clone());
    let report = runner.run(&question).await?;

    println!("{}", report.answer);
    log::info!(
        "RLM run finished after {} iteration(s), completed={}",
        report.iterations_used,
        report.completed
    );

    Ok(if report.completed { 0 } else { 1 })
}
