use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use lorawan_lib::constants::PROTOCOL_VERSION;
use lorawan_lib::mac::{
    DataFrame, JoinAcceptFrame, JoinRequestFrame, MacPayload, MessageType, classify, encode_data_frame,
};
use lorawan_lib::semtech::{
    self, GatewayFrame, Identifier, PullRespBody, PushDataBody, Rxpk, TxAckBody,
};
use lorawan_lib::types::{AesKey, DevAddr, DevNonce, Eui64};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// Developer tool for Semtech packet-forwarder datagrams and LoRaWAN frames.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a datagram (hex) or a bare PHY payload, checking MICs and decrypting where keys allow.
    Decode(DecodeArgs),
    /// Build a signed data uplink wrapped in PUSH_DATA.
    Forge(ForgeArgs),
    /// Build a signed Join-Request wrapped in PUSH_DATA.
    Join(JoinArgs),
}

#[derive(Args, Debug)]
struct DecodeArgs {
    /// Hex-encoded UDP datagram, or base64 PHY payload with --phy
    input: String,
    /// Treat the input as a base64 PHY payload
    #[arg(long)]
    phy: bool,
    /// Network session key (MIC of data frames)
    #[arg(long)]
    nwk_s_key: Option<AesKey>,
    /// Application session key (FRMPayload decryption)
    #[arg(long)]
    app_s_key: Option<AesKey>,
    /// Application root key (Join-Request MIC, Join-Accept decryption)
    #[arg(long)]
    app_key: Option<AesKey>,
    /// Use one key for every role above that was not given explicitly
    #[arg(short, long)]
    key: Option<AesKey>,
}

#[derive(Args, Debug)]
struct GatewayArgs {
    /// Gateway EUI placed in the PUSH_DATA header
    #[arg(long, default_value = "AA555A0000000101")]
    gateway: Eui64,
    /// Concentrator timestamp in microseconds
    #[arg(long, default_value_t = 3_121_882_787)]
    tmst: u32,
    /// Frequency in MHz
    #[arg(long, default_value_t = 868.1)]
    freq: f64,
    #[arg(long, default_value = "SF7BW125")]
    datr: String,
    /// Send the datagram to a running server and decode its reply
    #[arg(long)]
    send: Option<SocketAddr>,
    /// How long to wait for the reply, in milliseconds
    #[arg(long, default_value_t = 2000)]
    wait_ms: u64,
}

#[derive(Args, Debug)]
struct ForgeArgs {
    #[arg(long)]
    dev_addr: DevAddr,
    #[arg(long)]
    fcnt: u16,
    #[arg(long, default_value_t = 1)]
    fport: u8,
    /// Application payload, sent as UTF-8
    #[arg(long, default_value = "")]
    payload: String,
    #[arg(long)]
    nwk_s_key: AesKey,
    /// Defaults to the network session key
    #[arg(long)]
    app_s_key: Option<AesKey>,
    /// Send a Confirmed-Data-Up
    #[arg(long)]
    confirmed: bool,
    /// MAC commands piggybacked in FOpts, as hex (at most 15 bytes)
    #[arg(long)]
    fopts: Option<String>,
    #[command(flatten)]
    gateway: GatewayArgs,
}

#[derive(Args, Debug)]
struct JoinArgs {
    #[arg(long)]
    app_eui: Eui64,
    #[arg(long)]
    dev_eui: Eui64,
    /// DevNonce as it appears on air
    #[arg(long)]
    dev_nonce: DevNonce,
    #[arg(long)]
    app_key: AesKey,
    #[command(flatten)]
    gateway: GatewayArgs,
}

/// Keys available to the decoder, per role
struct KeyRing {
    nwk_s_key: Option<AesKey>,
    app_s_key: Option<AesKey>,
    app_key: Option<AesKey>,
}

impl From<&DecodeArgs> for KeyRing {
    fn from(args: &DecodeArgs) -> Self {
        Self {
            nwk_s_key: args.nwk_s_key.or(args.key),
            app_s_key: args.app_s_key.or(args.key),
            app_key: args.app_key.or(args.key),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    match cli.command {
        Command::Decode(args) => decode(&args),
        Command::Forge(args) => forge(args).await,
        Command::Join(args) => join(args).await,
    }
}

fn decode(args: &DecodeArgs) -> Result<()> {
    let keys = KeyRing::from(args);
    if args.phy {
        let phy = BASE64
            .decode(args.input.trim())
            .context("PHY payload is not valid base64")?;
        return print_phy(&phy, &keys);
    }

    let datagram = hex::decode(args.input.trim()).context("Datagram is not valid hex")?;
    let frame = semtech::decode(&datagram)?;
    print_gateway_frame(&frame, &keys)
}

fn print_gateway_frame(frame: &GatewayFrame, keys: &KeyRing) -> Result<()> {
    println!("Gateway frame:");
    println!("  Version: {}", frame.version);
    println!("  Token: {}", hex::encode_upper(frame.token));
    println!("  Identifier: {}", frame.identifier);
    if let Some(eui) = frame.gateway_eui {
        println!("  Gateway EUI: {}", eui);
    }

    match frame.identifier {
        Identifier::PushData => {
            let body = PushDataBody::parse(&frame.body)?;
            if let Some(stat) = &body.stat {
                println!("  Gateway status: {}", stat);
            }
            for (index, rxpk) in body.rxpk.iter().enumerate() {
                println!(
                    "rxpk[{}]: tmst={} freq={} datr={} rssi={} lsnr={:?} size={}",
                    index, rxpk.tmst, rxpk.freq, rxpk.datr, rxpk.rssi, rxpk.lsnr, rxpk.size
                );
                print_phy(&rxpk.payload()?, keys)?;
            }
        }
        Identifier::PullResp => {
            let body: PullRespBody = serde_json::from_slice(&frame.body)?;
            let txpk = &body.txpk;
            println!(
                "txpk: tmst={:?} freq={} datr={} powe={} ipol={} size={}",
                txpk.tmst, txpk.freq, txpk.datr, txpk.powe, txpk.ipol, txpk.size
            );
            print_phy(&txpk.payload()?, keys)?;
        }
        Identifier::TxAck => {
            let body = TxAckBody::parse(&frame.body)?;
            println!("  Accepted: {} ({:?})", body.is_accepted(), body.txpk_ack.error);
        }
        Identifier::PushAck | Identifier::PullData | Identifier::PullAck => {}
    }
    Ok(())
}

fn print_phy(phy: &[u8], keys: &KeyRing) -> Result<()> {
    debug!("PHY payload: {}", hex::encode_upper(phy));
    let Some(&mhdr) = phy.first() else {
        bail!("Empty PHY payload");
    };

    if classify(mhdr) == MessageType::JoinAccept {
        let Some(app_key) = &keys.app_key else {
            println!("  Join-Accept ({} bytes), AppKey needed to decrypt", phy.len());
            return Ok(());
        };
        let accept = JoinAcceptFrame::decode(phy, app_key)?;
        println!("  Join-Accept:");
        println!("    AppNonce: {}", accept.app_nonce);
        println!("    NetID: {}", accept.net_id);
        println!("    DevAddr: {}", accept.dev_addr);
        println!("    DLSettings: 0x{:02X}, RxDelay: {}", accept.dl_settings, accept.rx_delay);
        println!("    CFList: {}", accept.cf_list.is_some());
        println!("    MIC valid: {}", accept.verify_mic(app_key));
        return Ok(());
    }

    match MacPayload::try_from(Bytes::copy_from_slice(phy))? {
        MacPayload::JoinRequest(request) => print_join_request(&request, keys),
        MacPayload::DataUplink(frame) | MacPayload::DataDownlink(frame) => print_data_frame(&frame, keys),
        MacPayload::JoinAccept(_) => {}
    }
    Ok(())
}

fn print_join_request(request: &JoinRequestFrame, keys: &KeyRing) {
    println!("  Join-Request:");
    println!("    AppEUI: {}", request.app_eui);
    println!("    DevEUI: {}", request.dev_eui);
    println!("    DevNonce: {}", request.dev_nonce);
    println!("    MIC: {}", hex::encode_upper(request.mic));
    if let Some(app_key) = &keys.app_key {
        println!("    MIC valid: {}", request.verify_mic(app_key));
    }
}

fn print_data_frame(frame: &DataFrame, keys: &KeyRing) {
    println!("  {}:", frame.message_type());
    println!("    DevAddr: {}", frame.dev_addr);
    println!(
        "    FCtrl: adr={} ack={} fpending={} fopts_len={}",
        frame.fctrl.adr(),
        frame.fctrl.ack(),
        frame.fctrl.fpending(),
        frame.fctrl.fopts_len()
    );
    println!("    FCnt: {}", frame.fcnt);
    if !frame.fopts.is_empty() {
        println!("    FOpts: {}", hex::encode_upper(&frame.fopts));
    }
    println!("    FPort: {:?}", frame.fport);
    println!("    MIC: {}", hex::encode_upper(frame.mic));
    if let Some(nwk_s_key) = &keys.nwk_s_key {
        println!("    MIC valid: {}", frame.verify_mic(nwk_s_key));
    }

    // FPort 0 carries MAC commands under the network key
    let payload_key = match frame.fport {
        Some(0) => keys.nwk_s_key.as_ref(),
        _ => keys.app_s_key.as_ref(),
    };
    if let Some(key) = payload_key.filter(|_| !frame.frm_payload.is_empty()) {
        let plaintext = frame.decrypt_payload(key);
        match std::str::from_utf8(&plaintext) {
            Ok(text) => println!("    Decrypted: {:?}", text),
            Err(_) => println!("    Decrypted: {}", hex::encode_upper(&plaintext)),
        }
    }
}

fn push_data(phy: &[u8], gateway: &GatewayArgs) -> Result<Bytes> {
    let rxpk = Rxpk {
        time: None,
        tmms: None,
        tmst: gateway.tmst,
        chan: 0,
        rfch: 0,
        freq: gateway.freq,
        stat: 1,
        modu: "LORA".to_string(),
        datr: gateway.datr.clone(),
        codr: Some("4/5".to_string()),
        rssi: -40,
        lsnr: Some(9.5),
        size: phy.len() as u16,
        data: BASE64.encode(phy),
    };
    let body = PushDataBody {
        rxpk: vec![rxpk],
        stat: None,
    };
    let frame = GatewayFrame {
        version: PROTOCOL_VERSION,
        token: semtech::random_token(),
        identifier: Identifier::PushData,
        gateway_eui: Some(gateway.gateway),
        body: Bytes::from(serde_json::to_vec(&body)?),
    };
    Ok(frame.to_bytes())
}

async fn emit(phy: &[u8], gateway: &GatewayArgs, keys: KeyRing) -> Result<()> {
    let datagram = push_data(phy, gateway)?;
    println!("PHY (base64): {}", BASE64.encode(phy));
    println!("Datagram (hex): {}", hex::encode_upper(&datagram));

    let Some(server) = gateway.send else {
        return Ok(());
    };
    let socket = UdpSocket::bind("0.0.0.0:0").await.context("Failed to bind UDP socket")?;
    socket
        .send_to(&datagram, server)
        .await
        .with_context(|| format!("Failed to send to {}", server))?;

    // A downlink may follow the PUSH_ACK, so keep reading until the window closes
    let mut buf = vec![0u8; 65_535];
    let window = Duration::from_millis(gateway.wait_ms);
    while let Ok(received) = tokio::time::timeout(window, socket.recv_from(&mut buf)).await {
        let (len, peer) = received.context("Failed to receive reply")?;
        println!("Reply from {} (hex): {}", peer, hex::encode_upper(&buf[..len]));
        print_gateway_frame(&semtech::decode(&buf[..len])?, &keys)?;
    }
    Ok(())
}

async fn forge(args: ForgeArgs) -> Result<()> {
    let app_s_key = args.app_s_key.unwrap_or(args.nwk_s_key);
    let message_type = if args.confirmed {
        MessageType::ConfirmedDataUp
    } else {
        MessageType::UnconfirmedDataUp
    };
    let mut frame = DataFrame::new(message_type, args.dev_addr, args.fcnt);
    if let Some(fopts) = &args.fopts {
        let fopts = hex::decode(fopts).context("FOpts is not valid hex")?;
        frame = frame.with_fopts(Bytes::from(fopts))?;
    }
    if !args.payload.is_empty() || args.fport != 1 {
        let key = if args.fport == 0 { &args.nwk_s_key } else { &app_s_key };
        frame = frame.with_payload(args.fport, args.payload.as_bytes(), key);
    }
    let phy = encode_data_frame(&frame.sign(&args.nwk_s_key));

    let keys = KeyRing {
        nwk_s_key: Some(args.nwk_s_key),
        app_s_key: Some(app_s_key),
        app_key: None,
    };
    emit(&phy, &args.gateway, keys).await
}

async fn join(args: JoinArgs) -> Result<()> {
    let request = JoinRequestFrame::new(args.app_eui, args.dev_eui, args.dev_nonce, &args.app_key);
    let keys = KeyRing {
        nwk_s_key: None,
        app_s_key: None,
        app_key: Some(args.app_key),
    };
    emit(request.as_bytes(), &args.gateway, keys).await
}
