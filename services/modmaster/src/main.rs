//! modmaster command line
//!
//! Global flags override the configuration file, which overrides defaults.
//! Serial flags select RTU mode and cannot be combined with `--host`/`--port`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use common::logging::{self, LogConfig};
use modmaster::config::{parse_address, DecoderConfig, DecoderType, Parity, Protocol, ValueBase};
use modmaster::runtime::ReconnectPolicy;
use modmaster::transport::{serial_devices, TokioModbusFactory};
use modmaster::{
    AddressBase, Event, EventHub, ReadKind, ReadRequest, ReadResult, Service, ServiceConfig,
    ServiceOptions,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Modbus master for TCP and RTU devices")]
struct Args {
    /// Configuration file (yaml, toml or json)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    connection: ConnectionArgs,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write daily rolling log files to this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Randomise reconnect delays by up to 25%
    #[arg(long)]
    reconnect_jitter: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Default)]
struct ConnectionArgs {
    /// TCP host
    #[arg(long, conflicts_with_all = ["serial", "speed", "databits", "stopbits", "parity"])]
    host: Option<String>,

    /// TCP port
    #[arg(long, conflicts_with_all = ["serial", "speed", "databits", "stopbits", "parity"])]
    port: Option<u16>,

    /// Serial device path (enables RTU mode)
    #[arg(long, value_name = "DEVICE")]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    speed: Option<u32>,

    /// Serial data bits
    #[arg(long)]
    databits: Option<u8>,

    /// Serial stop bits
    #[arg(long)]
    stopbits: Option<u8>,

    /// Serial parity (none, even, odd)
    #[arg(long)]
    parity: Option<String>,

    /// Default unit id
    #[arg(long)]
    unit_id: Option<u8>,

    /// Request timeout in milliseconds
    #[arg(long, value_name = "MS")]
    timeout: Option<u64>,

    /// Address base (0 or 1)
    #[arg(long)]
    address_base: Option<u8>,

    /// Address display format (dec or hex)
    #[arg(long)]
    address_format: Option<String>,

    /// Value display format (dec or hex)
    #[arg(long)]
    value_base: Option<String>,

    /// Enable uint16 decoder (be/le)
    #[arg(long = "u16", value_name = "SPEC")]
    u16_spec: Option<String>,

    /// Enable int16 decoder (be/le)
    #[arg(long = "i16", value_name = "SPEC")]
    i16_spec: Option<String>,

    /// Enable uint32 decoder (be/le[,hf/lf])
    #[arg(long = "u32", value_name = "SPEC")]
    u32_spec: Option<String>,

    /// Enable int32 decoder (be/le[,hf/lf])
    #[arg(long = "i32", value_name = "SPEC")]
    i32_spec: Option<String>,

    /// Enable float32 decoder (be/le[,hf/lf])
    #[arg(long = "f32", value_name = "SPEC")]
    f32_spec: Option<String>,
}

impl ConnectionArgs {
    fn serial_mode(&self) -> bool {
        self.serial.is_some()
            || self.speed.is_some()
            || self.databits.is_some()
            || self.stopbits.is_some()
            || self.parity.is_some()
    }

    fn apply(&self, config: &mut ServiceConfig) -> anyhow::Result<()> {
        if self.serial_mode() {
            config.protocol = Protocol::Rtu;
        } else if self.host.is_some() || self.port.is_some() {
            config.protocol = Protocol::Tcp;
        }

        if let Some(device) = &self.serial {
            config.serial.device = device.clone();
        }
        if let Some(speed) = self.speed {
            config.serial.speed = speed;
        }
        if let Some(bits) = self.databits {
            config.serial.data_bits = bits;
        }
        if let Some(bits) = self.stopbits {
            config.serial.stop_bits = bits;
        }
        if let Some(parity) = &self.parity {
            config.serial.parity = parity.parse::<Parity>()?;
        }
        if let Some(host) = &self.host {
            config.tcp.host = host.clone();
        }
        if let Some(port) = self.port {
            config.tcp.port = port;
        }
        if let Some(unit_id) = self.unit_id {
            config.unit_id = unit_id;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_ms = timeout;
        }
        if let Some(base) = self.address_base {
            config.address_base = AddressBase::try_from(base).map_err(|e| anyhow!(e))?;
        }
        if let Some(format) = &self.address_format {
            config.address_format = format.parse::<ValueBase>()?;
        }
        if let Some(base) = &self.value_base {
            config.value_base = base.parse::<ValueBase>()?;
        }

        let specs = [
            (DecoderType::Uint16, &self.u16_spec),
            (DecoderType::Int16, &self.i16_spec),
            (DecoderType::Uint32, &self.u32_spec),
            (DecoderType::Int32, &self.i32_spec),
            (DecoderType::Float32, &self.f32_spec),
        ];
        for (decoder_type, spec) in specs {
            if let Some(spec) = spec {
                let defaults = config
                    .decoder(decoder_type)
                    .copied()
                    .unwrap_or_else(|| DecoderConfig::new(decoder_type));
                let decoder = DecoderConfig::from_spec(spec, defaults)
                    .with_context(|| format!("--{}", decoder_type.flag()))?;
                config.set_decoder(decoder);
            }
        }
        Ok(())
    }
}

#[derive(clap::Args, Debug)]
struct ReadArgs {
    /// Function: 01-04 or coils/discrete_inputs/holding_registers/input_registers
    #[arg(short, long, default_value = "holding_registers")]
    function: String,

    /// Start address, decimal or 0x-prefixed hex
    #[arg(short, long, default_value = "0")]
    address: String,

    /// Number of coils or registers
    #[arg(short = 'n', long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    count: u16,

    /// Unit id override for this read
    #[arg(long)]
    unit: Option<u8>,
}

impl ReadArgs {
    fn request(&self) -> anyhow::Result<ReadRequest> {
        let kind: ReadKind = self.function.parse()?;
        let address = parse_address(&self.address)?;
        Ok(ReadRequest::new(kind, address, self.count).with_unit(self.unit.unwrap_or(0)))
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Connect, read and print the values
    Read {
        #[command(flatten)]
        read: ReadArgs,

        /// Number of reads to perform
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Pause between repeated reads
        #[arg(long, value_name = "MS", default_value_t = 1000)]
        interval_ms: u64,

        /// Print results as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Connect and stream every event as a JSON line until interrupted
    Watch {
        /// Poll with this read while connected
        #[arg(long)]
        poll: bool,

        #[command(flatten)]
        read: ReadArgs,

        /// Poll interval
        #[arg(long, value_name = "MS", default_value_t = 1000)]
        interval_ms: u64,
    },
    /// List serial devices
    Ports,
    /// Print the effective configuration and its command line
    Config {
        /// Also write the configuration to this file
        #[arg(long, value_name = "FILE")]
        save: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = logging::parse_level(&args.log_level)
        .ok_or_else(|| anyhow!("invalid log level: {}", args.log_level))?;
    logging::init_with_config(
        LogConfig::new("modmaster")
            .with_level(level)
            .with_log_dir(args.log_dir.clone()),
    )
    .map_err(|e| anyhow!("failed to initialise logging: {}", e))?;

    let mut config = ServiceConfig::load(args.config.as_deref())?;
    args.connection.apply(&mut config)?;
    config.validate()?;

    let options = ServiceOptions {
        reconnect: ReconnectPolicy::default().with_jitter(args.reconnect_jitter),
        ..ServiceOptions::default()
    };

    match args.command {
        Commands::Read {
            read,
            repeat,
            interval_ms,
            json,
        } => {
            let service = new_service(config.clone(), options);
            run_read(service, config, &read, repeat, Duration::from_millis(interval_ms), json).await
        },
        Commands::Watch {
            poll,
            read,
            interval_ms,
        } => {
            let poll = if poll { Some(read.request()?) } else { None };
            run_watch(new_service(config, options), poll, Duration::from_millis(interval_ms)).await
        },
        Commands::Ports => list_ports(),
        Commands::Config { save } => show_config(&config, save),
    }
}

fn new_service(config: ServiceConfig, options: ServiceOptions) -> Service {
    Service::with_factory(config, Arc::new(TokioModbusFactory), options)
}

async fn run_read(
    service: Service,
    config: ServiceConfig,
    read: &ReadArgs,
    repeat: u32,
    interval: Duration,
    json: bool,
) -> anyhow::Result<()> {
    let request = read.request()?;
    let mut events = service
        .take_events()
        .context("event stream already taken")?;

    service.connect()?;
    let connected = wait_connected(&service, &mut events, config.timeout() * 5).await;
    // Nothing reads the stream from here on; publishing just drops
    drop(events);
    if let Err(e) = connected {
        if let Err(close_err) = service.disconnect().await {
            warn!(error = %close_err, "Disconnect after failed connect");
        }
        return Err(e);
    }

    let mut failures = 0u32;
    for i in 0..repeat.max(1) {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        match service.read(request).await {
            Ok(result) => print_result(&config, &result, json)?,
            Err(failure) => {
                failures += 1;
                if json {
                    println!("{}", serde_json::to_string(&failure.result)?);
                } else {
                    eprintln!("read failed ({}): {}", failure.kind(), failure);
                }
            },
        }
    }

    service.disconnect().await?;
    if failures > 0 {
        bail!("{} of {} reads failed", failures, repeat.max(1));
    }
    Ok(())
}

async fn wait_connected(
    service: &Service,
    events: &mut mpsc::Receiver<Event>,
    limit: Duration,
) -> anyhow::Result<()> {
    let waited = tokio::time::timeout(limit, async {
        loop {
            if service.is_connected() {
                return true;
            }
            match events.recv().await {
                Some(Event::Status(status)) if status.connected => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await;

    match waited {
        Ok(true) => Ok(()),
        Ok(false) => bail!("event stream closed before connecting"),
        Err(_) => {
            let reason = service
                .last_connect_error()
                .unwrap_or_else(|| "no response".to_string());
            bail!("not connected after {}ms: {}", limit.as_millis(), reason)
        },
    }
}

async fn run_watch(
    service: Service,
    poll: Option<ReadRequest>,
    interval: Duration,
) -> anyhow::Result<()> {
    let events = service
        .take_events()
        .context("event stream already taken")?;
    let hub = EventHub::spawn(events, 256);
    let mut subscriber = hub.subscribe();

    info!("Watching {}", service.config().connection_url());
    service.connect()?;

    let poller = poll.map(|request| {
        let service = service.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                if service.is_connected() {
                    // Outcome is reported through the event stream
                    let _ = service.read(request).await;
                }
            }
        })
    });

    let printer = async {
        loop {
            match subscriber.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Skipped {} events", skipped);
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    tokio::select! {
        signal = common::shutdown::wait_for_shutdown() => {
            info!("Stopping on {}", signal);
        }
        _ = printer => {}
    }

    if let Some(poller) = poller {
        poller.abort();
    }
    service.disconnect().await?;
    hub.shutdown();
    Ok(())
}

fn print_result(config: &ServiceConfig, result: &ReadResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(result)?);
        return Ok(());
    }

    println!(
        "{} @ {} x{} ({}ms)",
        result.kind,
        config.address_format.format_address(u32::from(result.address)),
        result.quantity,
        result.latency_ms
    );
    let address = |offset: usize| {
        config
            .address_format
            .format_address(u32::from(result.address) + offset as u32)
    };
    for (i, value) in result.bool_values.iter().enumerate() {
        println!("  {}: {}", address(i), u8::from(*value));
    }
    for (i, value) in result.reg_values.iter().enumerate() {
        println!("  {}: {}", address(i), config.value_base.format_value(*value));
    }
    for decoded in &result.decoded {
        println!(
            "  {}: {}",
            decoded.decoder_type,
            decoded.value.display(config.value_base)
        );
    }
    Ok(())
}

fn list_ports() -> anyhow::Result<()> {
    let devices = serial_devices()?;
    if devices.is_empty() {
        println!("no serial devices found");
    }
    for device in devices {
        match device.description {
            Some(description) => println!("{}\t{}", device.path, description),
            None => println!("{}", device.path),
        }
    }
    Ok(())
}

fn show_config(config: &ServiceConfig, save: Option<PathBuf>) -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(config)?);
    println!("# {}", config.invocation());
    if let Some(path) = save {
        common::config_loader::save_config_to_file(config, &path)?;
        info!("Configuration saved to {}", path.display());
    }
    Ok(())
}
