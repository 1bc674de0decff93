//! `brokerctl` — manage demo-broker invites from the CLI.
//!
//! Talks to the broker's admin HTTP surface via `BROKER_ADMIN_URL`,
//! authenticated with `BROKER_ADMIN_TOKEN`.

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "brokerctl", about = "Operate the demo session broker's invites")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new invite.
    Generate(GenerateArgs),
    /// List invites, optionally filtered by status.
    List(ListArgs),
    /// Show one invite's full record, including its audit trail.
    Info(TokenArg),
    /// Revoke an invite so it can never be used again.
    Revoke(TokenArg),
}

#[derive(Debug, Args)]
struct GenerateArgs {
    /// How long the invite stays valid, e.g. "1h", "30m", "7d".
    #[arg(long, default_value = "1h")]
    expires: String,
    /// Maximum number of sessions this invite may start.
    #[arg(long, default_value_t = 1)]
    max_uses: u32,
    /// Caller-supplied token text instead of a generated one.
    #[arg(long)]
    token: Option<String>,
    /// Free-form label for operator bookkeeping.
    #[arg(long)]
    label: Option<String>,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Filter by status: pending, used, expired, revoked.
    #[arg(long)]
    status: Option<String>,
}

#[derive(Debug, Args)]
struct TokenArg {
    token: String,
}

/// Parse a duration grammar of `<integer><unit>` where unit is one of
/// `m` (minutes), `h` (hours), `d` (days), `w` (weeks).
fn parse_duration_grammar(s: &str) -> Result<std::time::Duration, String> {
    let s = s.trim();
    let (digits, unit) = s.split_at(s.len().saturating_sub(1));
    let amount: u64 = digits.parse().map_err(|_| format!("invalid duration '{s}'"))?;
    let secs = match unit {
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86_400,
        "w" => amount * 604_800,
        _ => return Err(format!("unknown duration unit in '{s}', expected one of m/h/d/w")),
    };
    Ok(std::time::Duration::from_secs(secs))
}

fn apply_auth(req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(t) => req.bearer_auth(t),
        None => req,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let admin_url = match std::env::var("BROKER_ADMIN_URL") {
        Ok(u) => u.trim_end_matches('/').to_owned(),
        Err(_) => {
            eprintln!("error: BROKER_ADMIN_URL is not set");
            std::process::exit(2);
        }
    };
    let admin_token = std::env::var("BROKER_ADMIN_TOKEN").ok();

    let client = match reqwest::Client::builder().timeout(std::time::Duration::from_secs(10)).build() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: failed to build http client: {e}");
            std::process::exit(1);
        }
    };

    let code = match &cli.command {
        Command::Generate(args) => cmd_generate(&client, &admin_url, admin_token.as_deref(), args).await,
        Command::List(args) => cmd_list(&client, &admin_url, admin_token.as_deref(), args).await,
        Command::Info(args) => cmd_info(&client, &admin_url, admin_token.as_deref(), args).await,
        Command::Revoke(args) => cmd_revoke(&client, &admin_url, admin_token.as_deref(), args).await,
    };
    std::process::exit(code);
}

async fn cmd_generate(client: &reqwest::Client, admin_url: &str, token: Option<&str>, args: &GenerateArgs) -> i32 {
    let expires_in_secs = match parse_duration_grammar(&args.expires) {
        Ok(d) => d.as_secs(),
        Err(e) => {
            eprintln!("error: {e}");
            return 2;
        }
    };

    let body = serde_json::json!({
        "expires_in_secs": expires_in_secs,
        "max_uses": args.max_uses,
        "token": args.token,
        "label": args.label,
    });

    let url = format!("{admin_url}/admin/invites");
    let resp = match apply_auth(client.post(&url), token).json(&body).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };

    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if status.is_success() {
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(invite) => {
                let token = invite.get("token").and_then(|v| v.as_str()).unwrap_or("?");
                let expires_at = invite.get("expires_at").and_then(|v| v.as_str()).unwrap_or("?");
                println!("invite created:");
                println!("  token:      {token}");
                println!("  expires_at: {expires_at}");
                println!("  max_uses:   {}", args.max_uses);
            }
            Err(_) => println!("{text}"),
        }
        0
    } else {
        eprintln!("error ({status}): {text}");
        1
    }
}

async fn cmd_list(client: &reqwest::Client, admin_url: &str, token: Option<&str>, args: &ListArgs) -> i32 {
    let mut url = format!("{admin_url}/admin/invites");
    if let Some(status) = &args.status {
        url = format!("{url}?status={status}");
    }

    let resp = match apply_auth(client.get(&url), token).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };

    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if status.is_success() {
        match serde_json::from_str::<Vec<serde_json::Value>>(&text) {
            Ok(invites) => {
                if invites.is_empty() {
                    println!("No invites found.");
                } else {
                    println!("{:<24} {:<10} {:<8} {:<8}", "TOKEN", "STATUS", "USES", "MAX_USES");
                    println!("{}", "-".repeat(54));
                    for invite in &invites {
                        let token = invite.get("token").and_then(|v| v.as_str()).unwrap_or("?");
                        let status = invite.get("status").and_then(|v| v.as_str()).unwrap_or("?");
                        let use_count = invite.get("use_count").and_then(|v| v.as_u64()).unwrap_or(0);
                        let max_uses = invite.get("max_uses").and_then(|v| v.as_u64()).unwrap_or(0);
                        println!("{token:<24} {status:<10} {use_count:<8} {max_uses:<8}");
                    }
                }
                0
            }
            Err(_) => {
                println!("{text}");
                0
            }
        }
    } else {
        eprintln!("error ({status}): {text}");
        1
    }
}

async fn cmd_info(client: &reqwest::Client, admin_url: &str, token: Option<&str>, args: &TokenArg) -> i32 {
    let url = format!("{admin_url}/admin/invites/{}", args.token);
    let resp = match apply_auth(client.get(&url), token).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };

    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if status.is_success() {
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or(text)),
            Err(_) => println!("{text}"),
        }
        0
    } else {
        eprintln!("error ({status}): {text}");
        1
    }
}

async fn cmd_revoke(client: &reqwest::Client, admin_url: &str, token: Option<&str>, args: &TokenArg) -> i32 {
    let url = format!("{admin_url}/admin/invites/{}", args.token);
    let resp = match apply_auth(client.delete(&url), token).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {e}");
            return 1;
        }
    };

    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if status.is_success() {
        println!("invite {} revoked", args.token);
        0
    } else {
        eprintln!("error ({status}): {text}");
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minutes_hours_days_weeks() {
        assert_eq!(parse_duration_grammar("30m").unwrap(), std::time::Duration::from_secs(1800));
        assert_eq!(parse_duration_grammar("2h").unwrap(), std::time::Duration::from_secs(7200));
        assert_eq!(parse_duration_grammar("1d").unwrap(), std::time::Duration::from_secs(86_400));
        assert_eq!(parse_duration_grammar("1w").unwrap(), std::time::Duration::from_secs(604_800));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration_grammar("5x").is_err());
    }

    #[test]
    fn rejects_non_numeric_amount() {
        assert!(parse_duration_grammar("abch").is_err());
    }
}
