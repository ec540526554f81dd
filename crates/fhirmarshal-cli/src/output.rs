use colored::Colorize;
use fhirmarshal_bulk::ExportOutcome;
use fhirmarshal_db_postgres::LoadSummary;
use fhirmarshal_ingest::SkippedInput;
use tabled::builder::Builder;
use tabled::settings::Style;

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_warning(msg: &str) {
    eprintln!("{} {}", "!".yellow(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn print_skipped_inputs(skipped: &[SkippedInput]) {
    for input in skipped {
        print_warning(&format!("Skipped {}: {}", input.path.display(), input.reason));
    }
}

pub fn print_load_summary(summary: &LoadSummary) {
    if !summary.per_type.is_empty() {
        let mut builder = Builder::default();
        builder.push_record(["ResourceType", "Rows", "Batches", "Flush time"]);
        for (resource_type, stats) in &summary.per_type {
            builder.push_record([
                resource_type.clone(),
                stats.rows.to_string(),
                stats.batches.to_string(),
                format!("{:.2?}", stats.elapsed),
            ]);
        }
        println!("{}", builder.build().with(Style::rounded()));
    }

    println!(
        "{}: {}  {}: {}  {}: {}  {}: {:.2?}",
        "Read".cyan(),
        summary.records_read,
        "Written".cyan(),
        summary.rows_written,
        "Skipped".cyan(),
        summary.skipped,
        "Elapsed".cyan(),
        summary.elapsed
    );
    if summary.failed_batches > 0 {
        print_warning(&format!("{} batches failed", summary.failed_batches));
    }
    if summary.failed_containers > 0 {
        print_warning(&format!("{} inputs aborted", summary.failed_containers));
    }
}

pub fn print_export_outcome(outcome: &ExportOutcome) {
    println!("{}: {}", "Poll URL".cyan(), outcome.poll_url);
    println!(
        "{}: {} listed, {} staged",
        "Files".cyan(),
        outcome.listings.len(),
        outcome.staged.len()
    );
    for failed in &outcome.failed {
        print_warning(&format!(
            "{} ({}) not downloaded: {}",
            failed.listing.url, failed.listing.resource_type, failed.error
        ));
    }
    if outcome.lines_rejected > 0 {
        print_warning(&format!("{} lines could not be decoded", outcome.lines_rejected));
    }
    print_success(&format!(
        "{} resources written to {}",
        outcome.lines_written,
        outcome.output.display()
    ));
}
