use dl_harness::utils::{logger, validation::Validate};
use dl_harness::{CliArgs, HarnessError, ModuleRegistry, Orchestrator, RunState};

fn main() {
    let (cli, unknown_args) = CliArgs::parse_known_args();

    // 初始化日誌
    if cli.log_json {
        logger::init_json_logger(cli.verbose);
    } else {
        logger::init_cli_logger(cli.verbose);
    }

    tracing::info!("Starting dl-harness");
    if cli.verbose {
        tracing::debug!("CLI args: {:?}", cli);
        tracing::debug!("Forwarded overrides: {:?}", unknown_args);
    }

    // 驗證參數
    let run_args = cli.to_run_args();
    if let Err(e) = run_args.validate() {
        tracing::error!("❌ Argument validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        eprintln!("❌ {}", e.user_friendly_message());
        std::process::exit(e.severity().exit_code());
    }

    if cli.monitor {
        tracing::info!("🔍 System monitoring enabled");
    }

    let mut orchestrator = Orchestrator::new(run_args, unknown_args, ModuleRegistry::with_builtins())
        .with_archive(cli.archive_snapshot)
        .with_monitoring(cli.monitor);

    if cli.dry_run {
        match orchestrator.run_until(RunState::ConfigMerged) {
            Ok(_) => {
                println!("{}", orchestrator.describe_config());
                return;
            }
            Err(e) => fail(&orchestrator, e),
        }
    }

    // 失敗時一律經由 fail() 印出當下生效的設定
    match orchestrator.finish() {
        Ok(report) => {
            tracing::info!("✅ Run '{}' completed", report.model);
            println!("✅ Run '{}' completed after {} epochs", report.model, report.summary.epochs_run);
            if let Some(snapshot) = &report.snapshot {
                println!("📁 Sources snapshot: {}", snapshot);
            }
            for (loader, metrics) in &report.summary.final_metrics {
                for (name, value) in metrics {
                    println!("   {}/{}: {:.6}", loader, name, value);
                }
            }
        }
        Err(e) => fail(&orchestrator, e),
    }
}

fn fail(orchestrator: &Orchestrator, e: HarnessError) -> ! {
    // 記錄詳細錯誤信息
    tracing::error!(
        "❌ Run failed during {}: {} (Category: {:?}, Severity: {:?})",
        orchestrator
            .failed_during()
            .map(|state| state.to_string())
            .unwrap_or_else(|| "startup".to_string()),
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());

    // 輸出當下設定與用戶友好的錯誤信息
    eprintln!("{}", orchestrator.describe_config());
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());

    std::process::exit(e.severity().exit_code());
}
