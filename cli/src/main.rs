// btmesh: offline inspection of Bluetooth Mesh keys, PDUs and parameters.
//
// Nothing here touches a radio; every command works on hex input.

mod config;

use anyhow::{bail, Context, Result};
use btmesh_core::keys::NetworkKeyDerivatives;
use btmesh_core::pdu::{
    Heartbeat, LowerTransportPdu, NetworkPdu, NonceType, ProxyConfigurationMessage,
    SecureNetworkBeacon, SegmentAcknowledgment, SegmentKind,
};
use btmesh_core::{ApplicationKey, IvIndex, MeshAddress};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "btmesh")]
#[command(about = "Bluetooth Mesh key, PDU and parameter inspector", long_about = None)]
#[command(version)]
struct Cli {
    /// Also write a daily rolling log file into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the material derived from a network key
    Keys {
        /// 128-bit network key (hex)
        net_key: String,
    },
    /// Show the AID of an application key
    Aid {
        /// 128-bit application key (hex)
        app_key: String,
    },
    /// Show the virtual address of a Label UUID
    Virtual { label: Uuid },
    /// Decrypt a network PDU
    Decode {
        #[arg(long)]
        net_key: String,
        #[arg(long, default_value = "0")]
        iv_index: u32,
        /// Decrypt as a proxy configuration message
        #[arg(long)]
        proxy: bool,
        pdu: String,
    },
    /// Authenticate a secure network beacon
    Beacon {
        #[arg(long)]
        net_key: String,
        beacon: String,
    },
    /// Show the effective transport parameters
    Params {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Keys { net_key } => cmd_keys(&net_key),
        Commands::Aid { app_key } => cmd_aid(&app_key),
        Commands::Virtual { label } => cmd_virtual(label),
        Commands::Decode {
            net_key,
            iv_index,
            proxy,
            pdu,
        } => cmd_decode(&net_key, iv_index, proxy, &pdu),
        Commands::Beacon { net_key, beacon } => cmd_beacon(&net_key, &beacon),
        Commands::Params { config } => cmd_params(config),
    }
}

/// Stderr logging filtered by `RUST_LOG` (default `warn`), plus an optional
/// log file. The guard flushes the file writer on drop.
fn init_logging(
    log_dir: Option<&std::path::Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let stderr = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "btmesh.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            Ok(None)
        }
    }
}

fn parse_hex(value: &str) -> Result<Vec<u8>> {
    let cleaned: String = value
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&cleaned).with_context(|| format!("Invalid hex: {value}"))
}

fn parse_key(value: &str) -> Result<[u8; 16]> {
    let bytes = parse_hex(value)?;
    match <[u8; 16]>::try_from(bytes.as_slice()) {
        Ok(key) => Ok(key),
        Err(_) => bail!("A key is 16 bytes, got {}", bytes.len()),
    }
}

fn field(name: &str, value: impl std::fmt::Display) {
    println!("  {:<16} {}", format!("{name}:"), value);
}

fn cmd_keys(net_key: &str) -> Result<()> {
    let derived = NetworkKeyDerivatives::derive(&parse_key(net_key)?);
    println!("{}", "Network key material".bold());
    field("NID", format!("0x{:02X}", derived.nid).bright_cyan());
    field("Network ID", hex::encode_upper(derived.network_id).bright_cyan());
    field("Encryption key", hex::encode_upper(derived.encryption_key).bright_yellow());
    field("Privacy key", hex::encode_upper(derived.privacy_key).bright_yellow());
    field("Identity key", hex::encode_upper(derived.identity_key).bright_yellow());
    field("Beacon key", hex::encode_upper(derived.beacon_key).bright_yellow());
    Ok(())
}

fn cmd_aid(app_key: &str) -> Result<()> {
    let key = ApplicationKey::new(0, parse_key(app_key)?, 0);
    field("AID", format!("0x{:02X}", key.aid()).bright_cyan());
    Ok(())
}

fn cmd_virtual(label: Uuid) -> Result<()> {
    let address = MeshAddress::from_label(label);
    field("Label", label);
    field("Address", address.address.to_string().bright_cyan());
    Ok(())
}

fn cmd_decode(net_key: &str, iv_index: u32, proxy: bool, pdu: &str) -> Result<()> {
    let derived = NetworkKeyDerivatives::derive(&parse_key(net_key)?);
    let raw = parse_hex(pdu)?;
    let nonce = if proxy {
        NonceType::Proxy
    } else {
        NonceType::Network
    };
    let iv = IvIndex::new(iv_index, false);
    let decoded = NetworkPdu::decode(&raw, &derived, &iv, nonce)
        .context("PDU does not decrypt with this key and IV Index")?;
    debug!(len = raw.len(), "Network PDU decrypted");

    println!("{}", "Network PDU".bold());
    field("IV Index", decoded.iv_index);
    field("NID", format!("0x{:02X}", decoded.nid));
    field("CTL", decoded.control);
    field("TTL", decoded.ttl);
    field("SEQ", format!("0x{:06X}", decoded.sequence));
    field("SRC", decoded.source);
    field("DST", decoded.destination);
    field("Transport PDU", hex::encode_upper(&decoded.transport_pdu));

    if proxy {
        let message = ProxyConfigurationMessage::decode(&decoded.transport_pdu)
            .context("Invalid proxy configuration message")?;
        println!("{}", "Proxy configuration".bold());
        field("Message", format!("{message:?}").bright_cyan());
        return Ok(());
    }

    let lower = LowerTransportPdu::decode(&decoded.transport_pdu, decoded.control)
        .context("Invalid lower transport PDU")?;
    println!("{}", "Lower transport".bold());
    print_lower(&lower);
    Ok(())
}

fn print_lower(lower: &LowerTransportPdu) {
    match lower {
        LowerTransportPdu::Access {
            aid,
            upper_transport_pdu,
        } => {
            field("Type", "unsegmented access".bright_cyan());
            field("Key", key_label(*aid));
            field("Upper PDU", hex::encode_upper(upper_transport_pdu));
        }
        LowerTransportPdu::Control { opcode, parameters } => {
            field("Type", "unsegmented control".bright_cyan());
            field("Opcode", format!("0x{opcode:02X}"));
            match *opcode {
                SegmentAcknowledgment::OPCODE => match SegmentAcknowledgment::from_parameters(parameters) {
                    Ok(ack) => {
                        field("SeqZero", format!("0x{:04X}", ack.seq_zero));
                        field("BlockAck", format!("0x{:08X}", ack.block_ack));
                        field("OBO", ack.obo);
                    }
                    Err(e) => field("Error", e.to_string().red()),
                },
                Heartbeat::OPCODE => match Heartbeat::from_parameters(parameters) {
                    Ok(heartbeat) => {
                        field("Init TTL", heartbeat.init_ttl);
                        field("Features", format!("0x{:04X}", heartbeat.features));
                    }
                    Err(e) => field("Error", e.to_string().red()),
                },
                _ => field("Parameters", hex::encode_upper(parameters)),
            }
        }
        LowerTransportPdu::Segment(segment) => {
            match segment.kind {
                SegmentKind::Access { aid, szmic } => {
                    field("Type", "segmented access".bright_cyan());
                    field("Key", key_label(aid));
                    field("SZMIC", szmic);
                }
                SegmentKind::Control { opcode } => {
                    field("Type", "segmented control".bright_cyan());
                    field("Opcode", format!("0x{opcode:02X}"));
                }
            }
            field("SeqZero", format!("0x{:04X}", segment.seq_zero));
            field("Segment", format!("{} of {}", segment.seg_o, u16::from(segment.seg_n) + 1));
            field("Payload", hex::encode_upper(&segment.payload));
        }
    }
}

fn key_label(aid: Option<u8>) -> String {
    match aid {
        Some(aid) => format!("application key, AID 0x{aid:02X}"),
        None => "device key".to_string(),
    }
}

fn cmd_beacon(net_key: &str, beacon: &str) -> Result<()> {
    let derived = NetworkKeyDerivatives::derive(&parse_key(net_key)?);
    let (decoded, auth) =
        SecureNetworkBeacon::decode(&parse_hex(beacon)?).context("Invalid secure network beacon")?;

    println!("{}", "Secure network beacon".bold());
    field("Network ID", hex::encode_upper(decoded.network_id));
    field("IV Index", decoded.iv_index);
    field("Key Refresh", decoded.key_refresh);
    field("IV Update", decoded.iv_update_active);

    if decoded.network_id != derived.network_id {
        println!("  {} Beacon belongs to another network key", "✗".red());
        bail!("network ID mismatch");
    }
    if !decoded.authenticate(&auth, &derived.beacon_key) {
        println!("  {} Authentication value does not match", "✗".red());
        bail!("beacon authentication failed");
    }
    println!("  {} Authenticated", "✓".green());
    Ok(())
}

fn cmd_params(explicit: Option<PathBuf>) -> Result<()> {
    let (params, source) = config::load_parameters(explicit.as_deref())?;
    match source {
        config::Source::File(path) => println!("{} {}", "Loaded from".bold(), path.display()),
        config::Source::Defaults => println!("{}", "Built-in defaults".bold()),
    }
    println!("{}", serde_json::to_string_pretty(&params).context("Failed to serialize parameters")?);

    println!("{}", "Derived timers".bold());
    field("Discard", format!("{:?}", params.sar_discard_timeout()));
    field("Segment gap", format!("{:?}", params.sar_segment_interval()));
    field(
        "Unicast retry",
        format!(
            "{:?} (TTL {})",
            params.sar_unicast_retransmissions_interval(params.default_ttl),
            params.default_ttl
        ),
    );
    field("Multicast retry", format!("{:?}", params.sar_multicast_retransmissions_interval()));
    field("Ack timeout", format!("{:?}", params.acknowledgment_message_timeout()));
    Ok(())
}
