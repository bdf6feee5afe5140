use comfy_table::{Table, presets::UTF8_FULL};
use uplift_deploy::{ExecutionReport, StepReport, traits::VerificationResult};

fn verification_cell(step: &StepReport) -> String {
    match &step.verification {
        None => "-".to_string(),
        Some(VerificationResult::Verified) => "verified".to_string(),
        Some(VerificationResult::AlreadyVerified) => "already verified".to_string(),
        Some(VerificationResult::Failed(_)) => "failed".to_string(),
    }
}

/// One row per step: state, address, implementation and verification.
pub fn report_table(report: &ExecutionReport) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "Step",
        "State",
        "Contract",
        "Address",
        "Implementation",
        "Verification",
    ]);

    for step in &report.steps {
        let instance = step.instance.as_ref();
        let state = match instance {
            Some(instance) if instance.reused => format!("{} (reused)", step.state),
            _ => step.state.to_string(),
        };

        table.add_row(vec![
            step.name.clone(),
            state,
            instance
                .map(|i| i.artifact.logical_name.clone())
                .unwrap_or_default(),
            instance.map(|i| i.address.to_string()).unwrap_or_default(),
            instance
                .and_then(|i| i.implementation)
                .map(|address| address.to_string())
                .unwrap_or_default(),
            verification_cell(step),
        ]);
    }

    table
}

/// Print the table followed by every warning.
pub fn print_report(report: &ExecutionReport) {
    println!("{}", report_table(report));

    for (step, warning) in report.warnings() {
        println!("warning [{step}]: {warning}");
    }
}
