//! Operator CLI
//!
//! Thin layer over the REST surface plus the `serve` daemon entry point.
//! Exit codes: 0 success, 1 generic failure, 2 usage (clap), 3 auth,
//! 4 not found, 5 conflict, 6 license.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use crate::client::ControlClient;
use crate::config::Config;
use crate::error::{ControlError, Result};
use crate::types::{AuthMode, Protocol, Tier};
use crate::users::{Role, RoleAssignment};

#[derive(Debug, Parser)]
#[command(name = "fleetplane", version, about = "Control plane for a dual-tier proxy fleet")]
pub struct Cli {
    /// REST endpoint for client commands.
    #[arg(long, global = true, env = "FLEETPLANE_ENDPOINT", default_value = "http://127.0.0.1:8080")]
    pub endpoint: String,

    /// Bearer access token for client commands.
    #[arg(long, global = true, env = "FLEETPLANE_TOKEN")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cluster lifecycle
    Cluster {
        #[command(subcommand)]
        cmd: ClusterCmd,
    },
    /// Backend services
    Service {
        #[command(subcommand)]
        cmd: ServiceCmd,
    },
    /// Data-plane proxies
    Proxy {
        #[command(subcommand)]
        cmd: ProxyCmd,
    },
    /// Certificates and the cluster CA
    Cert {
        #[command(subcommand)]
        cmd: CertCmd,
    },
    /// Operator accounts
    User {
        #[command(subcommand)]
        cmd: UserCmd,
    },
    /// Run the control-plane daemon
    Serve {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ClusterCmd {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "community")]
        tier: String,
    },
    List,
    Get {
        id: String,
    },
    RotateKey {
        id: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Debug, Args)]
pub struct ClusterScope {
    /// Owning cluster id.
    #[arg(long = "cluster")]
    pub cluster: String,
}

#[derive(Debug, Subcommand)]
pub enum ServiceCmd {
    Create {
        #[command(flatten)]
        scope: ClusterScope,
        #[arg(long)]
        name: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        ports: String,
        #[arg(long)]
        protocol: String,
        #[arg(long, default_value = "none")]
        auth_mode: String,
    },
    List {
        #[command(flatten)]
        scope: ClusterScope,
    },
    Get {
        #[command(flatten)]
        scope: ClusterScope,
        id: String,
    },
    Update {
        #[command(flatten)]
        scope: ClusterScope,
        id: String,
        #[arg(long)]
        expected_version: u64,
        #[arg(long)]
        address: Option<String>,
        #[arg(long)]
        ports: Option<String>,
        #[arg(long)]
        protocol: Option<String>,
        #[arg(long)]
        auth_mode: Option<String>,
    },
    Delete {
        #[command(flatten)]
        scope: ClusterScope,
        id: String,
        /// Also rewrite or remove mappings that reference the service.
        #[arg(long)]
        cascade: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProxyCmd {
    List {
        #[command(flatten)]
        scope: ClusterScope,
    },
    Revoke {
        #[command(flatten)]
        scope: ClusterScope,
        id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum CertCmd {
    List {
        #[command(flatten)]
        scope: ClusterScope,
    },
    Revoke {
        #[command(flatten)]
        scope: ClusterScope,
        id: String,
        #[arg(long, default_value = "unspecified")]
        reason: String,
    },
    RotateCa {
        #[command(flatten)]
        scope: ClusterScope,
    },
}

#[derive(Debug, Subcommand)]
pub enum UserCmd {
    Create {
        #[arg(long)]
        login: String,
        #[arg(long)]
        password: String,
        /// `administrator` or `service-owner`.
        #[arg(long, default_value = "service-owner")]
        role: String,
        /// Cluster scope for the role; omit for a global assignment.
        #[arg(long)]
        cluster: Option<String>,
        #[arg(long)]
        totp: bool,
    },
    UpdateRole {
        id: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        cluster: Option<String>,
    },
    Lock {
        id: String,
    },
    Unlock {
        id: String,
    },
}

/// CLI exit code for an error, per the documented mapping.
pub fn exit_code(err: &ControlError) -> i32 {
    match err.kind() {
        "authentication" | "authorization" => 3,
        "not_found" => 4,
        "conflict" => 5,
        "quota" => 6,
        _ => 1,
    }
}

fn parse_enum<T: serde::de::DeserializeOwned>(field: &'static str, raw: &str) -> Result<T> {
    serde_json::from_value(json!(raw))
        .map_err(|_| ControlError::invalid_field(field, format!("unrecognized value `{raw}`")))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => eprintln!("failed to render response: {err}"),
    }
}

fn client(cli: &Cli) -> Result<ControlClient> {
    let mut builder = ControlClient::builder().base_url(cli.endpoint.clone());
    if let Some(token) = &cli.token {
        builder = builder.bearer_token(token.clone());
    }
    builder.build()
}

/// Dispatch a parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Serve { config } => {
            let config = match config {
                Some(path) => Config::load(path)?,
                None => Config::from_env()?,
            };
            crate::daemon::run(config).await
        }
        Command::Cluster { cmd } => run_cluster(&cli, cmd).await,
        Command::Service { cmd } => run_service(&cli, cmd).await,
        Command::Proxy { cmd } => run_proxy(&cli, cmd).await,
        Command::Cert { cmd } => run_cert(&cli, cmd).await,
        Command::User { cmd } => run_user(&cli, cmd).await,
    }
}

async fn run_cluster(cli: &Cli, cmd: &ClusterCmd) -> Result<()> {
    let client = client(cli)?;
    match cmd {
        ClusterCmd::Create { name, tier } => {
            let tier: Tier = parse_enum("tier", tier)?;
            let created: serde_json::Value = client
                .post("/api/v1/clusters", &json!({ "name": name, "tier": tier }))
                .await?;
            print_json(&created);
        }
        ClusterCmd::List => {
            let clusters: serde_json::Value = client.get("/api/v1/clusters").await?;
            print_json(&clusters);
        }
        ClusterCmd::Get { id } => {
            let cluster: serde_json::Value =
                client.get(&format!("/api/v1/clusters/{id}")).await?;
            print_json(&cluster);
        }
        ClusterCmd::RotateKey { id } => {
            let rotated: serde_json::Value = client
                .post(&format!("/api/v1/clusters/{id}/rotate-key"), &json!({}))
                .await?;
            print_json(&rotated);
        }
        ClusterCmd::Delete { id } => {
            client.delete(&format!("/api/v1/clusters/{id}")).await?;
        }
    }
    Ok(())
}

async fn run_service(cli: &Cli, cmd: &ServiceCmd) -> Result<()> {
    let client = client(cli)?;
    match cmd {
        ServiceCmd::Create {
            scope,
            name,
            address,
            ports,
            protocol,
            auth_mode,
        } => {
            let protocol: Protocol = parse_enum("protocol", protocol)?;
            let auth_mode: AuthMode = parse_enum("auth_mode", auth_mode)?;
            let created: serde_json::Value = client
                .post(
                    &format!("/api/v1/clusters/{}/services", scope.cluster),
                    &json!({
                        "name": name,
                        "address": address,
                        "ports": ports,
                        "protocol": protocol,
                        "auth_mode": auth_mode,
                    }),
                )
                .await?;
            print_json(&created);
        }
        ServiceCmd::List { scope } => {
            let services: serde_json::Value = client
                .get(&format!("/api/v1/clusters/{}/services", scope.cluster))
                .await?;
            print_json(&services);
        }
        ServiceCmd::Get { scope, id } => {
            let service: serde_json::Value = client
                .get(&format!("/api/v1/clusters/{}/services/{id}", scope.cluster))
                .await?;
            print_json(&service);
        }
        ServiceCmd::Update {
            scope,
            id,
            expected_version,
            address,
            ports,
            protocol,
            auth_mode,
        } => {
            let mut body = json!({ "expected_version": expected_version });
            if let Some(address) = address {
                body["address"] = json!(address);
            }
            if let Some(ports) = ports {
                body["ports"] = json!(ports);
            }
            if let Some(protocol) = protocol {
                body["protocol"] = json!(parse_enum::<Protocol>("protocol", protocol)?);
            }
            if let Some(auth_mode) = auth_mode {
                body["auth_mode"] = json!(parse_enum::<AuthMode>("auth_mode", auth_mode)?);
            }
            let updated: serde_json::Value = client
                .put(
                    &format!("/api/v1/clusters/{}/services/{id}", scope.cluster),
                    &body,
                )
                .await?;
            print_json(&updated);
        }
        ServiceCmd::Delete { scope, id, cascade } => {
            client
                .delete(&format!(
                    "/api/v1/clusters/{}/services/{id}?cascade={cascade}",
                    scope.cluster
                ))
                .await?;
        }
    }
    Ok(())
}

async fn run_proxy(cli: &Cli, cmd: &ProxyCmd) -> Result<()> {
    let client = client(cli)?;
    match cmd {
        ProxyCmd::List { scope } => {
            let proxies: serde_json::Value = client
                .get(&format!("/api/v1/clusters/{}/proxies", scope.cluster))
                .await?;
            print_json(&proxies);
        }
        ProxyCmd::Revoke { scope, id } => {
            client
                .post_action(
                    &format!("/api/v1/clusters/{}/proxies/{id}/revoke", scope.cluster),
                    &json!({}),
                )
                .await?;
        }
    }
    Ok(())
}

async fn run_cert(cli: &Cli, cmd: &CertCmd) -> Result<()> {
    let client = client(cli)?;
    match cmd {
        CertCmd::List { scope } => {
            let certs: serde_json::Value = client
                .get(&format!("/api/v1/clusters/{}/certs", scope.cluster))
                .await?;
            print_json(&certs);
        }
        CertCmd::Revoke { scope, id, reason } => {
            client
                .post_action(
                    &format!("/api/v1/clusters/{}/certs/{id}/revoke", scope.cluster),
                    &json!({ "reason": reason }),
                )
                .await?;
        }
        CertCmd::RotateCa { scope } => {
            let rotated: serde_json::Value = client
                .post(
                    &format!("/api/v1/clusters/{}/ca/rotate", scope.cluster),
                    &json!({}),
                )
                .await?;
            print_json(&rotated);
        }
    }
    Ok(())
}

async fn run_user(cli: &Cli, cmd: &UserCmd) -> Result<()> {
    let client = client(cli)?;
    let assignment = |role: &str, cluster: &Option<String>| -> Result<RoleAssignment> {
        Ok(RoleAssignment {
            cluster_id: cluster.clone(),
            role: parse_enum::<Role>("role", role)?,
        })
    };
    match cmd {
        UserCmd::Create {
            login,
            password,
            role,
            cluster,
            totp,
        } => {
            let created: serde_json::Value = client
                .post(
                    "/api/v1/users",
                    &json!({
                        "login": login,
                        "password": password,
                        "roles": [assignment(role, cluster)?],
                        "totp_enabled": totp,
                    }),
                )
                .await?;
            print_json(&created);
        }
        UserCmd::UpdateRole { id, role, cluster } => {
            let updated: serde_json::Value = client
                .put(
                    &format!("/api/v1/users/{id}/roles"),
                    &json!({ "roles": [assignment(role, cluster)?] }),
                )
                .await?;
            print_json(&updated);
        }
        UserCmd::Lock { id } => {
            let user: serde_json::Value = client
                .post(&format!("/api/v1/users/{id}/lock"), &json!({}))
                .await?;
            print_json(&user);
        }
        UserCmd::Unlock { id } => {
            let user: serde_json::Value = client
                .post(&format!("/api/v1/users/{id}/unlock"), &json!({}))
                .await?;
            print_json(&user);
        }
    }
    Ok(())
}
