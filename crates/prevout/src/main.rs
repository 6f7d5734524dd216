mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::WrapErr;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;

use prevout_core::rpc::{CallContext, ElectrumClient, ServerVersion};
use prevout_core::scripthash::address_scripthash;
use prevout_core::transport::CertificatePolicy;
use prevout_core::{classify, ClientConfig, Resolver, ResolverConfig};

use cli::{Cli, Command};

const CLIENT_NAME: &str = concat!("prevout/", env!("CARGO_PKG_VERSION"));
const PROTOCOL_VERSION: &str = "1.4";

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Cli::parse();
    init_tracing(args.wire_trace)?;

    let client_config = ClientConfig {
        server: args.server.clone(),
        certificate_policy: if args.insecure_tls {
            CertificatePolicy::AcceptInvalid
        } else {
            CertificatePolicy::WebPki
        },
        connect_timeout: Some(Duration::from_secs(args.connect_timeout_secs)),
        request_timeout: Some(Duration::from_secs(args.request_timeout_secs)),
        requests_per_second: args.requests_per_second,
        ..Default::default()
    };
    if args.insecure_tls {
        tracing::warn!("TLS certificate validation is disabled");
    }

    let client = Arc::new(
        ElectrumClient::connect(&client_config)
            .await
            .wrap_err_with(|| format!("while connecting to {}", args.server))?,
    );

    // Ctrl-C cancels whatever is in flight; commands then fail with a
    // cancellation error and the cache is still closed cleanly.
    let ctx = CallContext::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted; cancelling outstanding calls");
                ctx.cancel();
            }
        });
    }

    let version = handshake(&client, &ctx).await?;

    let resolver = Resolver::open(
        client.clone(),
        ResolverConfig {
            cache_path: Some(args.cache_path.clone()),
            input_concurrency: args.input_concurrency,
            history_concurrency: args.history_concurrency,
            network: args.network,
            ..Default::default()
        },
    )
    .wrap_err_with(|| format!("open transaction cache at {}", args.cache_path.display()))?;

    let outcome = run(&args, &client, &version, &resolver, &ctx).await;

    if let Err(err) = resolver.close() {
        tracing::warn!(error = %err, "failed to close transaction cache");
    }
    client.close();
    outcome
}

/// Negotiate the protocol version. Servers accept `server.version` once per
/// connection, so the result is kept for the `version` command.
async fn handshake(client: &ElectrumClient, ctx: &CallContext) -> eyre::Result<ServerVersion> {
    let version = client
        .server_version(ctx, CLIENT_NAME, PROTOCOL_VERSION)
        .await
        .wrap_err("negotiate protocol version")?;
    tracing::info!(
        server = %client.server(),
        software = %version.server_software,
        protocol = %version.protocol_version,
        "connected to Electrum server"
    );
    Ok(version)
}

async fn run(
    args: &Cli,
    client: &ElectrumClient,
    version: &ServerVersion,
    resolver: &Resolver,
    ctx: &CallContext,
) -> eyre::Result<()> {
    match &args.command {
        Command::Version => {
            let banner = client.banner(ctx).await.wrap_err("fetch server banner")?;
            print_json(&json!({
                "server": client.server(),
                "server_software": version.server_software,
                "protocol_version": version.protocol_version,
                "banner": banner,
            }))
        }
        Command::Tx { txid } => {
            let tx = resolver
                .fetch_transaction(ctx, txid)
                .await
                .wrap_err_with(|| format!("fetch transaction {txid}"))?;
            print_json(&tx)
        }
        Command::TxDetail { txid } => {
            let detailed = resolver
                .resolve_txid(ctx, txid)
                .await
                .wrap_err_with(|| format!("resolve transaction {txid}"))?;
            print_json(&detailed)
        }
        Command::History { address } => {
            let history = resolver
                .address_history(ctx, address)
                .await
                .wrap_err_with(|| format!("resolve history of {address}"))?;
            let totals = classify::totals(address, &history);
            print_json(&json!({
                "address": address,
                "history": history,
                "totals": totals,
            }))
        }
        Command::Balance { address } => {
            let scripthash = address_scripthash(address, args.network)?;
            let balance = client
                .get_balance(ctx, &scripthash)
                .await
                .wrap_err_with(|| format!("fetch balance of {address}"))?;
            print_json(&balance)
        }
        Command::Utxos { address } => {
            let scripthash = address_scripthash(address, args.network)?;
            let utxos = client
                .list_unspent(ctx, &scripthash)
                .await
                .wrap_err_with(|| format!("list unspent outputs of {address}"))?;
            print_json(&utxos)
        }
        Command::Broadcast { raw_tx_hex } => {
            let txid = client
                .broadcast(ctx, raw_tx_hex.trim())
                .await
                .wrap_err("broadcast transaction")?;
            print_json(&json!({ "txid": txid }))
        }
        Command::Merkle { txid, height } => {
            let proof = client
                .get_merkle(ctx, txid, *height)
                .await
                .wrap_err_with(|| format!("fetch merkle proof of {txid} at height {height}"))?;
            print_json(&proof)
        }
        Command::WatchHeaders => {
            let (tip, subscription) = client
                .subscribe_headers(ctx)
                .await
                .wrap_err("subscribe to headers")?;
            print_json(&tip)?;

            let mut headers = Box::pin(subscription.into_stream());
            loop {
                tokio::select! {
                    next = headers.next() => match next {
                        Some(header) => print_json(&header?)?,
                        None => eyre::bail!("connection to {} lost", client.server()),
                    },
                    _ = ctx.done() => return Ok(()),
                }
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> eyre::Result<()> {
    let rendered = serde_json::to_string_pretty(value).wrap_err("render output")?;
    println!("{rendered}");
    Ok(())
}

fn init_tracing(wire_trace: bool) -> eyre::Result<()> {
    let mut filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if wire_trace {
        filter = filter.add_directive("prevout::wire=trace".parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();
    Ok(())
}
