use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use insight_core::{InsightConfig, ResourceReference, SourceDocument};
use insight_fhir::{derive_bundle_with, enrich_resource_with, ReplayOracle, ServiceRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "insight-cli",
    about = "Derive a FHIR transaction bundle from clinical text and recorded NLP output."
)]
struct Args {
    /// Clinical text the annotations were computed over.
    #[arg(short, long, required_unless_present = "resource", conflicts_with = "resource")]
    text: Option<PathBuf>,
    /// Structured resource (AllergyIntolerance, Condition, Immunization) to enrich in place.
    #[arg(short, long)]
    resource: Option<PathBuf>,
    /// Recorded annotation service output (JSON).
    #[arg(short, long)]
    annotations: PathBuf,
    /// Pipeline settings (JSON); defaults apply to anything left out.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Patient reference placed on every resource, e.g. `Patient/123`.
    #[arg(short, long)]
    subject: Option<String>,
    /// Id of the source DocumentReference.
    #[arg(long)]
    document_id: Option<String>,
    /// Name the recorded service is registered under.
    #[arg(long, default_value = "acd")]
    service: String,
    /// Ignore the MedicationInd section of the recorded output.
    #[arg(long)]
    no_medication_enrichment: bool,
    #[arg(long)]
    pretty: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config {:?}", path))?;
            serde_json::from_str::<InsightConfig>(&data)
                .with_context(|| format!("invalid config {:?}", path))?
        }
        None => InsightConfig::default(),
    };

    let annotations = std::fs::read_to_string(&args.annotations)
        .with_context(|| format!("cannot read annotations {:?}", args.annotations))?;

    let mut oracle = ReplayOracle::from_json(args.service.as_str(), &annotations)?;
    if !args.no_medication_enrichment {
        oracle = oracle.with_medication_enrichment();
    }

    let mut registry = ServiceRegistry::new();
    registry.register(args.service.as_str(), Arc::new(oracle));
    registry.activate(&args.service)?;

    let bundle = match (&args.resource, &args.text) {
        (Some(path), _) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read resource {:?}", path))?;
            let resource: serde_json::Value = serde_json::from_str(&data)
                .with_context(|| format!("invalid resource {:?}", path))?;
            match enrich_resource_with(&registry, resource, &config)? {
                Some(bundle) => bundle,
                None => {
                    info!("no insights found, nothing to update");
                    return Ok(());
                }
            }
        }
        (None, Some(path)) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read text {:?}", path))?;
            let mut document = SourceDocument::new("DocumentReference", text);
            document.id = args.document_id.clone();
            document.subject = args.subject.clone().map(ResourceReference::to);
            derive_bundle_with(&registry, &document, &config)?
        }
        (None, None) => anyhow::bail!("either --text or --resource is required"),
    };
    info!(entries = bundle.entries().len(), "bundle ready");

    let json = if args.pretty {
        bundle.to_json_pretty()?
    } else {
        bundle.to_json()?
    };
    println!("{json}");

    Ok(())
}
