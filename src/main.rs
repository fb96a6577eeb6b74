use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use clickstats::clock::SystemClock;
use clickstats::config::Config;
use clickstats::models::{
    ChartType, ClickEvent, DeviceType, Granularity, NewReport, PeriodPolicy, Principal,
    ReportUpdate, ResourceKind, ResourceRef, Role,
};
use clickstats::stats::{ReportStatsQuery, StatsEngine};
use clickstats::storage::Stores;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clickstats")]
#[command(about = "Click statistics and report access management", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    Init,
    /// Register a user login
    AddUser { login: String },
    /// Make a user the first admin of a resource
    GrantCreator {
        /// Resource kind (link, report)
        kind: ResourceKind,
        id: String,
        login: String,
    },
    /// Record a click on a short link
    Click {
        link_id: String,
        #[arg(long, default_value = "desktop")]
        device: DeviceType,
        #[arg(long, default_value = "unknown")]
        browser: String,
        #[arg(long)]
        referrer: Option<String>,
        /// RFC 3339 timestamp, defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// List grants on a resource (admin only)
    Permissions {
        kind: ResourceKind,
        id: String,
        #[arg(long = "as", value_name = "LOGIN")]
        acting: String,
    },
    /// Give another user a role on a resource
    Grant {
        kind: ResourceKind,
        id: String,
        target: String,
        role: Role,
        #[arg(long = "as", value_name = "LOGIN")]
        acting: String,
    },
    /// Change another user's role on a resource
    Update {
        kind: ResourceKind,
        id: String,
        target: String,
        role: Role,
        #[arg(long = "as", value_name = "LOGIN")]
        acting: String,
    },
    /// Remove another user's grant on a resource
    Revoke {
        kind: ResourceKind,
        id: String,
        target: String,
        #[arg(long = "as", value_name = "LOGIN")]
        acting: String,
    },
    /// Aggregate statistics for one or more short links
    Stats {
        #[arg(required = true)]
        link_ids: Vec<String>,
        #[arg(long)]
        granularity: Option<Granularity>,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
    /// Create a report over short links the caller can view
    CreateReport {
        name: String,
        link_ids: Vec<String>,
        #[arg(long, default_value = "day")]
        granularity: Granularity,
        /// last24h, last7d, last30d, last365d, allTime or custom
        #[arg(long, default_value = "allTime")]
        period: String,
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        #[arg(long)]
        end: Option<DateTime<Utc>>,
        #[arg(long = "as", value_name = "LOGIN")]
        acting: String,
    },
    /// Edit a report (editor or admin)
    UpdateReport {
        report_id: String,
        #[arg(long)]
        name: Option<String>,
        /// Replaces the bundled links
        #[arg(long = "link", num_args = 1..)]
        links: Option<Vec<String>>,
        #[arg(long)]
        granularity: Option<Granularity>,
        #[arg(long)]
        chart: Option<ChartType>,
        #[arg(long)]
        period: Option<String>,
        #[arg(long)]
        start: Option<DateTime<Utc>>,
        #[arg(long)]
        end: Option<DateTime<Utc>>,
        #[arg(long = "as", value_name = "LOGIN")]
        acting: String,
    },
    /// List the reports a user holds a grant on
    Reports {
        #[arg(long = "as", value_name = "LOGIN")]
        acting: String,
    },
    /// Statistics for a report, on the report's own window unless overridden
    ReportStats {
        report_id: String,
        #[arg(long)]
        granularity: Option<Granularity>,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        /// Minutes behind UTC; negative is ahead (UTC+3 is -180)
        #[arg(long, allow_negative_numbers = true)]
        tz_offset: Option<i32>,
        #[arg(long = "as", value_name = "LOGIN")]
        acting: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn principal(stores: &Stores, login: &str) -> Result<Principal> {
    let user = stores
        .users
        .user_by_login(login)
        .await?
        .with_context(|| format!("unknown user '{login}'"))?;
    Ok(user.principal())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    let stores = Stores::connect(&config.database).await?;
    let engine = StatsEngine::new(stores.clone(), Arc::new(SystemClock));

    match cli.command {
        Commands::Init => {
            info!("Database initialized");
            println!("✓ Database ready ({})", config.database.url);
        }
        Commands::AddUser { login } => {
            let user = stores.users.create_user(&login).await?;
            print_json(&user)?;
        }
        Commands::GrantCreator { kind, id, login } => {
            let user = principal(&stores, &login).await?;
            let grant = engine
                .access()
                .grant_admin_to_creator(&ResourceRef::new(kind, id), &user.user_id)
                .await?;
            print_json(&grant)?;
        }
        Commands::Click {
            link_id,
            device,
            browser,
            referrer,
            at,
        } => {
            let event = ClickEvent::new(
                link_id,
                at.unwrap_or_else(Utc::now),
                device,
                browser,
                referrer.as_deref(),
            );
            engine.record_click(&event).await?;
            println!("✓ Recorded click on '{}'", event.resource_id);
        }
        Commands::Permissions { kind, id, acting } => {
            let acting = principal(&stores, &acting).await?;
            let grants = engine
                .access()
                .get_permissions(&ResourceRef::new(kind, id), &acting)
                .await?;
            if grants.is_empty() {
                println!("No other users have access.");
            } else {
                println!("{:<40} {}", "User ID", "Role");
                println!("{}", "-".repeat(50));
                for grant in grants {
                    println!("{:<40} {}", grant.user_id, grant.role);
                }
            }
        }
        Commands::Grant {
            kind,
            id,
            target,
            role,
            acting,
        } => {
            let acting = principal(&stores, &acting).await?;
            let grant = engine
                .access()
                .add_permission(&ResourceRef::new(kind, id), &acting, &target, role)
                .await?;
            println!("✓ Granted {} on {} to '{}'", grant.role, grant.resource, target);
        }
        Commands::Update {
            kind,
            id,
            target,
            role,
            acting,
        } => {
            let acting = principal(&stores, &acting).await?;
            let grant = engine
                .access()
                .update_permission_role(&ResourceRef::new(kind, id), &acting, &target, role)
                .await?;
            println!("✓ '{}' is now {} on {}", target, grant.role, grant.resource);
        }
        Commands::Revoke {
            kind,
            id,
            target,
            acting,
        } => {
            let acting = principal(&stores, &acting).await?;
            let resource = ResourceRef::new(kind, id);
            engine
                .access()
                .remove_permission(&resource, &acting, &target)
                .await?;
            println!("✓ Revoked access to {} from '{}'", resource, target);
        }
        Commands::Stats {
            link_ids,
            granularity,
            from,
            to,
        } => {
            let granularity = granularity.unwrap_or(config.stats.default_granularity);
            let report = engine
                .build_report_stats(&link_ids, granularity, from, to)
                .await?
                .aligned();
            print_json(&report)?;
        }
        Commands::CreateReport {
            name,
            link_ids,
            granularity,
            period,
            start,
            end,
            acting,
        } => {
            let acting = principal(&stores, &acting).await?;
            let period = PeriodPolicy::from_parts(&period, start, end)?;
            let report = engine
                .create_report(
                    &acting,
                    NewReport {
                        name,
                        short_link_ids: link_ids,
                        granularity,
                        period,
                        ..Default::default()
                    },
                )
                .await?;
            print_json(&report)?;
        }
        Commands::UpdateReport {
            report_id,
            name,
            links,
            granularity,
            chart,
            period,
            start,
            end,
            acting,
        } => {
            let acting = principal(&stores, &acting).await?;
            let period = period
                .map(|kind| PeriodPolicy::from_parts(&kind, start, end))
                .transpose()?;
            let report = engine
                .update_report(
                    &acting,
                    &report_id,
                    ReportUpdate {
                        name,
                        short_link_ids: links,
                        granularity,
                        chart_type: chart,
                        period,
                    },
                )
                .await?;
            print_json(&report)?;
        }
        Commands::Reports { acting } => {
            let acting = principal(&stores, &acting).await?;
            print_json(&engine.list_reports(&acting).await?)?;
        }
        Commands::ReportStats {
            report_id,
            granularity,
            from,
            to,
            tz_offset,
            acting,
        } => {
            let acting = principal(&stores, &acting).await?;
            let stats = engine
                .report_stats(
                    &acting,
                    &report_id,
                    ReportStatsQuery {
                        granularity,
                        from,
                        to,
                        tz_offset_minutes: tz_offset
                            .unwrap_or(config.stats.default_tz_offset_minutes),
                    },
                )
                .await?;
            print_json(&stats)?;
        }
    }

    Ok(())
}
