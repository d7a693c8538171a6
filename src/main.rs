use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use prettytable::{Cell, Row as PrettyRow, Table};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use annalist::archive::{months_between, ArchiveSource, NytArchiveClient};
use annalist::config::RetryConfig;
use annalist::error::CapabilityError;
use annalist::llm::{LLMClient, LLMParams, LlmCapability};
use annalist::model::Article;
use annalist::{
    Database, IngestionCoordinator, IngestionOutcome, IngestionResult, Settings, TimelineOrder,
    TopicId, TARGET_INGEST,
};

#[derive(Parser)]
#[command(author, version, about = "Reconciled news timelines per topic", long_about = None)]
struct Cli {
    /// Database file (overrides DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download archive months and store their articles
    CrawlArchive {
        /// First month, as YYYY-MM
        #[arg(long, value_parser = parse_year_month)]
        from: (i32, u32),

        /// Last month, as YYYY-MM (defaults to --from)
        #[arg(long, value_parser = parse_year_month)]
        to: Option<(i32, u32)>,
    },

    /// Ingest stored articles that are not yet ingested
    IngestArchive {
        /// Maximum number of articles to ingest
        #[arg(short, long, default_value = "100")]
        limit: i64,

        /// Ingest every article under this topic instead of discovering topics
        #[arg(short, long)]
        topic: Option<String>,
    },

    /// Emit the synthesis input for a topic as JSON
    Generate {
        /// Topic id or name
        topic: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// List canonical topics
    Topics,

    /// Show a topic's timeline
    Timeline {
        /// Topic id or name
        topic: String,

        /// event-time or report-time
        #[arg(short, long, default_value = "event-time")]
        order: TimelineOrder,
    },

    /// Show store statistics
    Stats,

    /// Merge two topics; the older one survives
    MergeTopics {
        /// Topic id or name
        first: String,

        /// Topic id or name
        second: String,
    },

    /// Allow writes to a quarantined topic again
    ClearQuarantine {
        /// Topic id
        topic_id: String,
    },
}

fn parse_year_month(value: &str) -> Result<(i32, u32), String> {
    let (year, month) = value
        .split_once('-')
        .ok_or_else(|| format!("expected YYYY-MM, got '{}'", value))?;
    let year: i32 = year.parse().map_err(|_| format!("invalid year in '{}'", value))?;
    let month: u32 = month.parse().map_err(|_| format!("invalid month in '{}'", value))?;
    if !(1..=12).contains(&month) {
        return Err(format!("month must be 1-12, got {}", month));
    }
    Ok((year, month))
}

#[tokio::main]
async fn main() -> Result<()> {
    annalist::logging::configure_logging();

    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    if let Some(database) = cli.database {
        settings.database_path = database;
    }

    let db = Database::new(&settings.database_path)
        .await
        .context("Failed to connect to database")?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_err() {
            error!("Failed to listen for ctrl-c");
            return;
        }
        warn!("Ctrl-C received, stopping after the current step");
        let _ = cancel_tx.send(true);
    });

    let coordinator = || {
        let params = LLMParams {
            llm_client: LLMClient::from_settings(&settings.llm),
            model: settings.llm.model.clone(),
            temperature: settings.llm.temperature,
        };
        let capability = LlmCapability::new(params, settings.ingest.max_topics_per_article);
        IngestionCoordinator::new(db.clone(), Arc::new(capability), &settings.pipeline())
            .with_cancellation(cancel_rx.clone())
    };

    match cli.command {
        Commands::CrawlArchive { from, to } => {
            let client = NytArchiveClient::new(settings.archive.clone())?;
            crawl_archive(&client, &db, from, to.unwrap_or(from), &settings.retry, &cancel_rx).await?;
        }

        Commands::IngestArchive { limit, topic } => {
            let articles = db.pending_articles(limit).await?;
            if articles.is_empty() {
                println!("{}", "Nothing to ingest".yellow());
                return Ok(());
            }
            info!(target: TARGET_INGEST, "Ingesting {} pending articles", articles.len());

            let coordinator = coordinator();
            let results = match topic {
                Some(topic) => {
                    let mut results = Vec::with_capacity(articles.len());
                    for article in &articles {
                        if *cancel_rx.borrow() {
                            break;
                        }
                        let result = match coordinator.ingest_for_topic(article, &topic).await {
                            Ok(result) => result,
                            Err(e) => {
                                error!(target: TARGET_INGEST, "Could not record ingestion of {}: {}", article.id, e);
                                IngestionResult::unrecorded(&article.id, &e)
                            }
                        };
                        results.push(result);
                    }
                    results
                }
                None => coordinator.ingest_batch(&articles).await,
            };
            print_ingestion_results(&results);
        }

        Commands::Generate { topic, output } => {
            let coordinator = coordinator();
            let topic_id = resolve_topic_arg(&coordinator, &topic).await?;
            let input = coordinator.feed().synthesis_input(&topic_id).await?;
            let json = serde_json::to_string_pretty(&input)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path))?;
                    println!("{} {}", "Synthesis input saved to".green(), path);
                }
                None => println!("{}", json),
            }
        }

        Commands::Topics => {
            let coordinator = coordinator();
            let topics = coordinator.registry().list_topics().await?;
            let mut table = Table::new();
            table.add_row(PrettyRow::new(vec![
                Cell::new("ID"),
                Cell::new("Name"),
                Cell::new("Aliases"),
                Cell::new("Created"),
            ]));
            for topic in &topics {
                table.add_row(PrettyRow::new(vec![
                    Cell::new(topic.id.as_str()),
                    Cell::new(&topic.name),
                    Cell::new(&topic.aliases.join(", ")),
                    Cell::new(&topic.created_at.format("%Y-%m-%d %H:%M").to_string()),
                ]));
            }
            table.printstd();
            println!("{} topics", topics.len());
        }

        Commands::Timeline { topic, order } => {
            let coordinator = coordinator();
            let topic_id = resolve_topic_arg(&coordinator, &topic).await?;
            let events = coordinator.feed().get_timeline(&topic_id, order).await?;

            let mut table = Table::new();
            table.add_row(PrettyRow::new(vec![
                Cell::new("When happened"),
                Cell::new("First reported"),
                Cell::new("Sources"),
                Cell::new("Confidence"),
                Cell::new("Description"),
            ]));
            for event in &events {
                let when = event
                    .event_time
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                table.add_row(PrettyRow::new(vec![
                    Cell::new(&when),
                    Cell::new(&event.report_time.format("%Y-%m-%d").to_string()),
                    Cell::new(&event.provenance.len().to_string()),
                    Cell::new(&format!("{:.2}", event.confidence)),
                    Cell::new(&event.description),
                ]));
            }
            println!("{} ({})", "Timeline".bright_blue(), order);
            table.printstd();
        }

        Commands::Stats => {
            let stats = db.collect_stats().await?;
            let mut table = Table::new();
            for (label, value) in [
                ("Articles", stats.articles),
                ("Ingested", stats.ingested),
                ("Failed", stats.failed),
                ("Topics", stats.topics),
                ("Topic redirects", stats.redirects),
                ("Quarantined topics", stats.quarantined),
                ("Events", stats.events),
                ("Merged events", stats.merged_events),
                ("Statements", stats.statements),
                ("Capability calls", stats.capability_calls),
                ("Failed calls", stats.failed_calls),
            ] {
                table.add_row(PrettyRow::new(vec![Cell::new(label), Cell::new(&value.to_string())]));
            }
            table.printstd();
        }

        Commands::MergeTopics { first, second } => {
            let coordinator = coordinator();
            let first = resolve_topic_arg(&coordinator, &first).await?;
            let second = resolve_topic_arg(&coordinator, &second).await?;
            let (survivor, summary) = coordinator.merge_topics(&first, &second).await?;
            println!(
                "{} {} ({} events folded)",
                "Merged into".green(),
                survivor,
                summary.events_merged
            );
        }

        Commands::ClearQuarantine { topic_id } => {
            if db.clear_quarantine(&TopicId::from(topic_id.as_str())).await? {
                println!("{} {}", "Cleared quarantine for".green(), topic_id);
            } else {
                println!("{} {}", "No quarantine for".yellow(), topic_id);
            }
        }
    }

    Ok(())
}

/// Accepts a topic id or any name the topic is known under.
async fn resolve_topic_arg(coordinator: &IngestionCoordinator, value: &str) -> Result<TopicId> {
    let registry = coordinator.registry();
    let as_id = TopicId::from(value);
    if registry.get_topic(&as_id).await?.is_some() {
        return Ok(registry.canonical(&as_id).await?);
    }
    registry
        .lookup(value)
        .await?
        .ok_or_else(|| anyhow!("No topic matches '{}'; run `annalist topics` to list them", value))
}

async fn fetch_month_with_retry(
    client: &dyn ArchiveSource,
    year: i32,
    month: u32,
    retry: &RetryConfig,
) -> Result<Vec<Article>, CapabilityError> {
    let mut retries = 0;
    loop {
        match client.fetch_month(year, month).await {
            Err(e) if e.is_transient() && retries < retry.max_retries => {
                let delay = retry.backoff(retries);
                warn!("Archive {}-{:02} failed ({}), retrying in {:?}", year, month, e, delay);
                sleep(delay).await;
                retries += 1;
            }
            result => return result,
        }
    }
}

async fn crawl_archive(
    client: &dyn ArchiveSource,
    db: &Database,
    from: (i32, u32),
    to: (i32, u32),
    retry: &RetryConfig,
    cancel: &watch::Receiver<bool>,
) -> Result<()> {
    let months = months_between(from, to);
    if months.is_empty() {
        bail!("--to must not be before --from");
    }

    for (year, month) in months {
        if *cancel.borrow() {
            break;
        }
        let articles = fetch_month_with_retry(client, year, month, retry)
            .await
            .with_context(|| format!("Failed to fetch archive {}-{:02}", year, month))?;

        let mut stored = 0;
        for article in &articles {
            if db.store_article(article).await? {
                stored += 1;
            }
        }
        println!(
            "{}-{:02}: {} articles, {} new",
            year,
            month,
            articles.len(),
            stored.to_string().green()
        );
    }
    Ok(())
}

fn print_ingestion_results(results: &[IngestionResult]) {
    let mut table = Table::new();
    table.add_row(PrettyRow::new(vec![
        Cell::new("Article"),
        Cell::new("Outcome"),
        Cell::new("Topics"),
        Cell::new("Events +/="),
        Cell::new("Statements +/="),
        Cell::new("Warnings"),
    ]));
    for result in results {
        let outcome = match result.outcome {
            IngestionOutcome::Ingested => "ingested",
            IngestionOutcome::IngestedWithWarnings => "warnings",
            IngestionOutcome::Failed => "failed",
        };
        table.add_row(PrettyRow::new(vec![
            Cell::new(&result.article_id),
            Cell::new(outcome),
            Cell::new(&result.topics.len().to_string()),
            Cell::new(&format!(
                "{}/{}",
                result.summary.events_created, result.summary.events_merged
            )),
            Cell::new(&format!(
                "{}/{}",
                result.summary.statements_created, result.summary.statements_deduplicated
            )),
            Cell::new(&result.warnings.len().to_string()),
        ]));
    }
    table.printstd();

    let failed: Vec<&IngestionResult> = results
        .iter()
        .filter(|r| r.outcome == IngestionOutcome::Failed)
        .collect();
    if failed.is_empty() {
        println!("{}", format!("{} articles ingested", results.len()).green());
    } else {
        println!("{}", format!("{} of {} articles failed", failed.len(), results.len()).red());
        for result in failed {
            println!("  {} {}", result.article_id, result.error.as_deref().unwrap_or("").dimmed());
        }
    }
}
