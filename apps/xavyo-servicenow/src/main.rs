//! xavyo-servicenow - drive the ServiceNow connector from the command line
//!
//! Reads `SERVICENOW_*` settings from the environment (or a `.env` file) and
//! prints every result as JSON on stdout. Paged commands print one page and
//! its `next_token`; pass that back with `--token` to continue.

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use xavyo_connector_servicenow::{
    AccountProfile, ResourceId, ResourceType, ServiceNowConfig, ServiceNowConnector,
    TicketRequest,
};

mod error;

use error::{CliError, CliResult};

/// ServiceNow connector driver
#[derive(Parser)]
#[command(name = "xavyo-servicenow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Print compact JSON instead of pretty JSON
    #[arg(long, global = true)]
    compact: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the configured account can read every table the connector uses
    Validate,

    /// List users
    Users {
        #[arg(long, default_value = "")]
        token: String,
    },

    /// List groups
    Groups {
        #[arg(long, default_value = "")]
        token: String,
    },

    /// List grantable roles
    Roles {
        #[arg(long, default_value = "")]
        token: String,
    },

    /// List users and groups holding a role
    Grants {
        role_id: String,
        #[arg(long, default_value = "")]
        token: String,
    },

    /// List members of a group
    Members {
        group_id: String,
        #[arg(long, default_value = "")]
        token: String,
    },

    /// Grant an entitlement such as `role:<id>:member` or `group:<id>:member`
    Grant {
        entitlement_id: String,
        #[command(flatten)]
        principal: PrincipalArgs,
    },

    /// Revoke an entitlement
    Revoke {
        entitlement_id: String,
        #[command(flatten)]
        principal: PrincipalArgs,
    },

    /// Add a user to a group
    AddMember {
        group_id: String,
        /// User `sys_id`
        #[arg(long)]
        user_id: String,
    },

    /// Remove a user from a group
    RemoveMember {
        group_id: String,
        /// User `sys_id`
        #[arg(long)]
        user_id: String,
    },

    /// Create an account
    CreateAccount {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
    },

    /// Mark an account active
    Enable { user_id: String },

    /// Mark an account inactive
    Disable { user_id: String },

    /// List catalog items as ticket schemas
    TicketSchemas {
        #[arg(long, default_value = "")]
        token: String,
    },

    /// Show one requested item
    Ticket { ticket_id: String },

    /// Order a catalog item. The request is read as JSON from a file
    CreateTicket {
        schema_id: String,
        /// Path to a JSON ticket request
        #[arg(long)]
        request: std::path::PathBuf,
    },
}

#[derive(clap::Args)]
struct PrincipalArgs {
    /// Principal type: user or group
    #[arg(long, value_parser = parse_principal_type)]
    principal_type: ResourceType,

    /// Principal `sys_id`
    #[arg(long)]
    principal_id: String,
}

impl PrincipalArgs {
    fn resource_id(&self) -> ResourceId {
        ResourceId::new(self.principal_type, self.principal_id.clone())
    }
}

fn parse_principal_type(value: &str) -> Result<ResourceType, String> {
    value.parse::<ResourceType>().map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so stdout stays JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,xavyo_connector_servicenow=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            e.print();
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let config = ServiceNowConfig::from_env().map_err(|e| CliError::Config(e.to_string()))?;
    tracing::info!(instance = %config.instance_url(), "Loaded configuration");
    let connector = ServiceNowConnector::new(config)?;
    let compact = cli.compact;

    match cli.command {
        Commands::Validate => {
            connector.validate().await?;
            print_json(&connector.metadata(), compact)
        }
        Commands::Users { token } => print_json(&connector.list_users(&token).await?, compact),
        Commands::Groups { token } => print_json(&connector.list_groups(&token).await?, compact),
        Commands::Roles { token } => print_json(&connector.list_roles(&token).await?, compact),
        Commands::Grants { role_id, token } => {
            print_json(&connector.role_grants(&role_id, &token).await?, compact)
        }
        Commands::Members { group_id, token } => {
            print_json(&connector.group_grants(&group_id, &token).await?, compact)
        }
        Commands::Grant {
            entitlement_id,
            principal,
        } => print_json(
            &connector
                .grant(&principal.resource_id(), &entitlement_id)
                .await?,
            compact,
        ),
        Commands::Revoke {
            entitlement_id,
            principal,
        } => print_json(
            &connector
                .revoke(&principal.resource_id(), &entitlement_id)
                .await?,
            compact,
        ),
        Commands::AddMember { group_id, user_id } => print_json(
            &connector
                .add_member(&ResourceId::user(user_id), &group_id)
                .await?,
            compact,
        ),
        Commands::RemoveMember { group_id, user_id } => print_json(
            &connector
                .remove_member(&ResourceId::user(user_id), &group_id)
                .await?,
            compact,
        ),
        Commands::CreateAccount {
            username,
            email,
            first_name,
            last_name,
        } => {
            let profile = AccountProfile {
                username,
                email,
                first_name,
                last_name,
            };
            print_json(&connector.create_account(&profile).await?, compact)
        }
        Commands::Enable { user_id } => {
            connector.enable_user(&user_id).await?;
            print_json(&connector.get_user(&user_id).await?, compact)
        }
        Commands::Disable { user_id } => {
            connector.disable_user(&user_id).await?;
            print_json(&connector.get_user(&user_id).await?, compact)
        }
        Commands::TicketSchemas { token } => {
            print_json(&connector.list_ticket_schemas(&token).await?, compact)
        }
        Commands::Ticket { ticket_id } => {
            print_json(&connector.get_ticket(&ticket_id).await?, compact)
        }
        Commands::CreateTicket { schema_id, request } => {
            let raw = std::fs::read_to_string(&request).map_err(|e| {
                CliError::Validation(format!("cannot read {}: {e}", request.display()))
            })?;
            let ticket_request: TicketRequest = serde_json::from_str(&raw)
                .map_err(|e| CliError::Validation(format!("invalid ticket request: {e}")))?;
            let schema = connector.get_ticket_schema(&schema_id).await?;
            print_json(
                &connector.create_ticket(&schema, &ticket_request).await?,
                compact,
            )
        }
    }
}

fn print_json<T: Serialize>(value: &T, compact: bool) -> CliResult<()> {
    let out = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{out}");
    Ok(())
}
