//! uplift deploys and upgrades proxied contracts from a declarative plan.

mod cli;
mod settings;
mod summary;

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command, DeployArgs, ValidateArgs};
use settings::Settings;
use uplift_deploy::{
    AddressBook, ArtifactResolver, CancelHandle, DeploymentPlan, ExecutorConfig, PlanExecutor,
    Step,
    backends::{HardhatArtifacts, HardhatVerifier, MemoryChain, ProxyFactories, RpcChainClient},
    traits::{ArtifactSource, ChainClient, Verifier},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let settings = Settings::load(&cli.config)?;

    match cli.command {
        Command::Deploy(args) => deploy(settings, args).await,
        Command::Validate(args) => validate(settings, args),
    }
}

/// Load the plan and fold the instances of an earlier address book into its
/// imports. Imports written in the plan win over the book.
fn load_plan(plan_path: &Path, imports: Option<&Path>) -> Result<(DeploymentPlan, DeploymentPlan)> {
    let declared = DeploymentPlan::load_from_file(plan_path)?;
    let mut plan = declared.clone();

    if let Some(book_path) = imports {
        let book = AddressBook::load_from_file(book_path)?;
        if !book.matches(&declared) {
            tracing::warn!(
                book = %book_path.display(),
                "Address book was produced by a different version of this plan"
            );
        }

        for (name, address) in book.addresses() {
            plan.imports.entry(name).or_insert(address);
        }
    }

    Ok((declared, plan))
}

fn validate(settings: Settings, args: ValidateArgs) -> Result<()> {
    let settings = match args.artifacts {
        Some(artifacts) => Settings {
            artifacts: Some(artifacts),
            ..settings
        },
        None => settings,
    };

    let (_, plan) = load_plan(&args.plan, args.imports.as_deref())?;
    let artifacts = HardhatArtifacts::load(&settings.artifacts_dir())?;

    let executor = PlanExecutor::new(
        artifacts,
        MemoryChain::default(),
        HardhatVerifier::new(&settings.project_root, &settings.network),
        ExecutorConfig::default().resume(args.resume),
    );

    let order = executor
        .validate(&plan)
        .context(format!("Plan {} is invalid", args.plan.display()))?;

    tracing::info!(steps = order.len(), "Plan is valid");
    for (position, step) in order.iter().enumerate() {
        println!("{:>3}. {} ({})", position + 1, step.name(), step.artifact());
    }

    Ok(())
}

async fn deploy(settings: Settings, args: DeployArgs) -> Result<()> {
    let settings = settings.with_connection(&args.connection);
    let (declared, mut plan) = load_plan(&args.plan, args.imports.as_deref())?;

    let config = ExecutorConfig::default()
        .verify(settings.verify && !args.no_verify)
        .confirmation_timeout(
            args.confirmation_timeout
                .or(settings.confirmation_timeout_secs)
                .map(Duration::from_secs),
        )
        .resume(args.resume)
        .retry_delay(Duration::from_millis(settings.verification_retry_delay_ms))
        .verification_timeout(Duration::from_secs(settings.verification_timeout_secs));

    let artifacts = HardhatArtifacts::load(&settings.artifacts_dir())?;
    let verifier = HardhatVerifier::new(&settings.project_root, &settings.network);

    let cancel = CancelHandle::new();
    let interrupted = cancel.clone();
    tokio::spawn(async move {
        cancel_on_interrupt(interrupted, tokio::signal::ctrl_c).await;
        std::process::exit(INTERRUPTED_EXIT_CODE);
    });

    tracing::info!(
        plan = %args.plan.display(),
        steps = plan.steps.len(),
        imports = plan.imports.len(),
        dry_run = args.dry_run,
        "Deploying plan..."
    );

    if args.dry_run {
        disable_verification(&mut plan);
        let executor = PlanExecutor::new(artifacts, MemoryChain::default(), verifier, config)
            .with_cancel(cancel);
        return run(&executor, &declared, &plan, args.out.as_deref()).await;
    }

    let proxies = ProxyFactories::load(&ArtifactResolver::new(artifacts.clone()));
    let chain = RpcChainClient::connect(
        settings.rpc_url.clone(),
        settings.sender,
        proxies,
        Duration::from_secs(settings.ready_timeout_secs),
    )
    .await?;

    let executor = PlanExecutor::new(artifacts, chain, verifier, config).with_cancel(cancel);
    run(&executor, &declared, &plan, args.out.as_deref()).await
}

/// Execute, print the summary and write the address book. A failed run still
/// writes the instances it deployed so a later `--resume` can pick them up.
async fn run<A, C, V>(
    executor: &PlanExecutor<A, C, V>,
    declared: &DeploymentPlan,
    plan: &DeploymentPlan,
    out: Option<&Path>,
) -> Result<()>
where
    A: ArtifactSource,
    C: ChainClient,
    V: Verifier,
{
    match executor.execute(plan).await {
        Ok(report) => {
            summary::print_report(&report);
            if let Some(out) = out {
                AddressBook::from_report(declared, &report)?.save_to_file(out)?;
                tracing::info!(path = %out.display(), "Address book written");
            }
            tracing::info!(instances = report.instances.len(), "Plan completed");
            Ok(())
        }
        Err(failure) => {
            summary::print_report(&failure.report);
            if let Some(out) = out {
                if !failure.completed.is_empty() {
                    let fingerprint = declared
                        .fingerprint()
                        .context("Failed to fingerprint deployment plan")?;
                    AddressBook::new(fingerprint, failure.completed.clone()).save_to_file(out)?;
                    tracing::warn!(
                        path = %out.display(),
                        instances = failure.completed.len(),
                        "Partial address book written"
                    );
                }
            }
            Err(failure).context("Deployment plan did not complete")
        }
    }
}

/// Dry runs deploy to throwaway addresses that no explorer knows about.
fn disable_verification(plan: &mut DeploymentPlan) {
    for step in &mut plan.steps {
        match step {
            Step::Deploy(step) => step.verify = Some(false),
            Step::Upgrade(step) => step.verify = Some(false),
        }
    }
}

/// Exit status after a forced second interrupt, as shells report SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Stop starting new steps on the first interrupt. Returns on the second one,
/// which the caller turns into an immediate exit.
async fn cancel_on_interrupt<F, Fut>(cancel: CancelHandle, mut interrupt: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    if let Err(err) = interrupt().await {
        tracing::error!(error = %err, "Failed to install Ctrl+C handler");
        return std::future::pending().await;
    }
    tracing::warn!(
        "Received Ctrl+C, finishing the current step before stopping (press again to exit now)"
    );
    cancel.cancel();

    if let Err(err) = interrupt().await {
        tracing::error!(error = %err, "Failed to listen for Ctrl+C");
        return std::future::pending().await;
    }
    tracing::warn!("Received second Ctrl+C, exiting without waiting for the current step");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_second_interrupt_returns() {
        let interrupts = Arc::new(Notify::new());
        let cancel = CancelHandle::new();

        let source = Arc::clone(&interrupts);
        let handler = tokio::spawn(cancel_on_interrupt(cancel.clone(), move || {
            let source = Arc::clone(&source);
            async move {
                source.notified().await;
                Ok(())
            }
        }));

        interrupts.notify_one();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cancel.is_cancelled() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("first interrupt cancels");
        assert!(!handler.is_finished());

        interrupts.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handler)
            .await
            .expect("second interrupt returns")
            .expect("handler task");
    }
}
