//! Dispatches a parsed [`crate::cli::Commands`] against an [`crate::EdgeRuntime`]
//! and prints the result.

use anyhow::{Context, Result};
use futures::StreamExt;

use crate::cli::{Commands, OutputFormat};
use crate::EdgeRuntime;

fn print_result<T: serde::Serialize>(value: &T, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => println!("{value:#?}", value = serde_json::to_value(value)?),
    }
    Ok(())
}

pub async fn execute_command(command: Commands, runtime: &EdgeRuntime, output: OutputFormat) -> Result<()> {
    match command {
        Commands::InitAdmin { username, password, display_name } => {
            let id = runtime.bootstrap_admin(&username, &password, &display_name).await?;
            println!("registered admin {id}");
        }
        Commands::Login { username, password } => {
            let session = runtime.login(&username, &password).await?;
            print_result(&session, output)?;
        }
        Commands::Logout { token } => {
            runtime.logout(&token).await?;
            println!("logged out");
        }
        Commands::Chat { token, subject_id, grade, question } => {
            let handle = runtime.chat(&token, subject_id, grade.into(), question).await?;
            println!("queue position: {}", handle.queue_position());
            let mut stream = handle.into_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(text) => print!("{text} "),
                    Err(e) => {
                        println!();
                        return Err(anyhow::anyhow!(e));
                    }
                }
            }
            println!();
        }
        Commands::QueueStats => {
            let stats = runtime.queue_stats();
            print_result(
                &serde_json::json!({
                    "active": stats.active,
                    "queued": stats.queued,
                    "completed_total": stats.completed_total,
                    "rejected_total": stats.rejected_total,
                }),
                output,
            )?;
        }
        Commands::CacheStats => print_result(&runtime.cache_stats(), output)?,
        Commands::CacheInvalidate { token, subject_id } => {
            runtime.cache_invalidate(&token, subject_id).await?;
            println!("cache invalidated");
        }
        Commands::Progress { token } => print_result(&runtime.progress(&token).await?, output)?,
        Commands::WeakAreas { token } => print_result(&runtime.weak_areas(&token).await?, output)?,
        Commands::Practice { token, subject_id, topic, count } => {
            print_result(&runtime.practice(&token, subject_id, &topic, count).await?, output)?;
        }
        Commands::WeeklyReport { token, subject_id, start, end } => {
            let start = chrono::DateTime::parse_from_rfc3339(&start)
                .context("start must be an RFC 3339 timestamp")?
                .with_timezone(&chrono::Utc);
            let end = chrono::DateTime::parse_from_rfc3339(&end)
                .context("end must be an RFC 3339 timestamp")?
                .with_timezone(&chrono::Utc);
            print_result(&runtime.weekly_report(&token, subject_id, start, end).await?, output)?;
        }
        Commands::UploadCurriculum { token, subject_id, grade, path } => {
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .context("path must have a filename")?
                .to_string();
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let ack = runtime.upload_curriculum(&token, subject_id, grade.into(), &filename, bytes).await?;
            print_result(&ack, output)?;
        }
        Commands::CreateSubject { token, grade, name, code } => {
            let id = runtime.create_subject(&token, grade.into(), &name, &code).await?;
            println!("created subject {id}");
        }
        Commands::ListSubjects { token } => print_result(&runtime.list_subjects(&token).await?, output)?,
        Commands::UpdateSubject { token, subject_id, name, code } => {
            runtime.update_subject(&token, subject_id, &name, &code).await?;
            println!("updated subject {subject_id}");
        }
        Commands::DeleteSubject { token, subject_id } => {
            runtime.delete_subject(&token, subject_id).await?;
            println!("deleted subject {subject_id}");
        }
        Commands::ListUsers { token } => print_result(&runtime.list_users(&token).await?, output)?,
        Commands::RegisterUser { token, username, password, role, display_name } => {
            let id = runtime.register_user(&token, &username, &password, role.into(), &display_name).await?;
            println!("registered user {id}");
        }
        Commands::PullCurriculum => {
            runtime.pull_curriculum_updates().await;
            println!("pull cycle complete");
        }
        Commands::Health => print_result_health(&runtime.check_health().await, output)?,
        Commands::BackupNow { token } => {
            let id = runtime.backup_now(&token).await?;
            println!("backup {id}");
        }
        Commands::ListBackups { token } => print_result(&runtime.list_backups(&token).await?, output)?,
        Commands::Rollback { token, target } => {
            runtime.rollback(&token, &target).await?;
            println!("rolled back to {target}");
        }
    }
    Ok(())
}

fn print_result_health(report: &tutor_resilience::HealthReport, output: OutputFormat) -> Result<()> {
    let probes: Vec<_> = report
        .probes
        .iter()
        .map(|p| serde_json::json!({ "name": p.name, "status": format!("{:?}", p.status), "detail": p.detail }))
        .collect();
    print_result(&serde_json::json!({ "healthy": report.is_healthy(), "probes": probes }), output)
}
