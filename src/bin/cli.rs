//! Modmon CLI - Command-line Modbus master
//!
//! One-shot reads and writes plus a continuous monitor mode, for scripting
//! and headless operation.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::time::Duration;

use modmon_core::{
    list_ports, ExchangeOptions, FunctionCode, ModbusClient, Protocol, ReadRequest, Response,
    ResponseData, SerialConfig, SerialParity, SerialTransport, WriteRequest, WriteValue,
    ClientEvent,
};

/// CLI output format
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Protocol selection
#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProtocolArg {
    /// Modbus RTU (binary, CRC-16)
    Rtu,
    /// Modbus ASCII (hex text, LRC)
    Ascii,
}

impl From<ProtocolArg> for Protocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Rtu => Protocol::Rtu,
            ProtocolArg::Ascii => Protocol::Ascii,
        }
    }
}

/// Register kind to access
#[derive(Debug, Clone, Copy, ValueEnum)]
enum RegisterKind {
    /// Read/write bits (FC01 / FC05 / FC15)
    Coil,
    /// Read-only bits (FC02)
    Discrete,
    /// Read/write 16-bit registers (FC03 / FC06 / FC16)
    Holding,
    /// Read-only 16-bit registers (FC04)
    Input,
}

impl RegisterKind {
    fn read_function(self) -> FunctionCode {
        match self {
            Self::Coil => FunctionCode::ReadCoils,
            Self::Discrete => FunctionCode::ReadDiscreteInputs,
            Self::Holding => FunctionCode::ReadHoldingRegisters,
            Self::Input => FunctionCode::ReadInputRegisters,
        }
    }
}

/// Serial link parameters shared by all commands
#[derive(Debug, Args)]
struct LinkArgs {
    /// Serial port name (e.g., COM3, /dev/ttyUSB0)
    #[arg(short, long, env = "MODMON_PORT")]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "9600")]
    baud: u32,

    /// Data bits (5-8)
    #[arg(long, default_value = "8")]
    data_bits: u8,

    /// Parity (none, odd, even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1, 2)
    #[arg(long, default_value = "1")]
    stop_bits: u8,

    /// Protocol variant
    #[arg(long, value_enum, default_value_t = ProtocolArg::Rtu)]
    protocol: ProtocolArg,
}

impl LinkArgs {
    async fn open_client(&self) -> anyhow::Result<ModbusClient> {
        let parity: SerialParity = self.parity.parse().unwrap_or_default();
        let config = SerialConfig::new(&self.port, self.baud)
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits)
            .parity(parity);
        let transport = SerialTransport::new(config);
        let client = ModbusClient::new(Box::new(transport), self.protocol.into());
        client.connect().await?;
        Ok(client)
    }
}

/// Modmon CLI
#[derive(Parser, Debug)]
#[command(
    name = "modmon",
    version,
    about = "Modbus RTU/ASCII master and register monitor",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts,

    /// Read coils, discrete inputs or registers once
    Read {
        #[command(flatten)]
        link: LinkArgs,

        /// Slave id (1-247)
        #[arg(short, long)]
        slave: u8,

        /// Register kind
        #[arg(short = 't', long, value_enum, default_value_t = RegisterKind::Holding)]
        kind: RegisterKind,

        /// Start address
        #[arg(short, long)]
        address: u16,

        /// Item count
        #[arg(short, long, default_value = "1")]
        quantity: u16,
    },

    /// Write coils or holding registers
    Write {
        #[command(flatten)]
        link: LinkArgs,

        /// Slave id (1-247)
        #[arg(short, long)]
        slave: u8,

        /// Register kind (coil or holding)
        #[arg(short = 't', long, value_enum, default_value_t = RegisterKind::Holding)]
        kind: RegisterKind,

        /// Start address
        #[arg(short, long)]
        address: u16,

        /// Value(s); one value writes single, several write multiple
        #[arg(required = true)]
        values: Vec<u16>,
    },

    /// Poll a read continuously and print each result
    Monitor {
        #[command(flatten)]
        link: LinkArgs,

        /// Slave id (1-247)
        #[arg(short, long)]
        slave: u8,

        /// Register kind
        #[arg(short = 't', long, value_enum, default_value_t = RegisterKind::Holding)]
        kind: RegisterKind,

        /// Start address
        #[arg(short, long)]
        address: u16,

        /// Item count
        #[arg(short, long, default_value = "1")]
        quantity: u16,

        /// Poll interval in milliseconds
        #[arg(short, long, default_value = "1000")]
        interval: u64,

        /// Stop after this many responses (default: run until Ctrl-C)
        #[arg(long)]
        count: Option<u64>,
    },
}

fn print_response(response: &Response, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(response)?),
        OutputFormat::Text => match &response.data {
            ResponseData::Registers(values) => {
                for (offset, value) in values.iter().enumerate() {
                    println!(
                        "{:>5}: {} (0x{:04X})",
                        response.address as usize + offset,
                        value,
                        value
                    );
                }
            }
            ResponseData::Coils(states) => {
                for (offset, state) in states.iter().enumerate() {
                    println!(
                        "{:>5}: {}",
                        response.address as usize + offset,
                        if *state { 1 } else { 0 }
                    );
                }
            }
            ResponseData::Echo => println!("ok"),
        },
    }
    Ok(())
}

fn build_write_value(kind: RegisterKind, values: &[u16]) -> anyhow::Result<(FunctionCode, WriteValue)> {
    match (kind, values.len()) {
        (RegisterKind::Coil, 1) => Ok((
            FunctionCode::WriteSingleCoil,
            WriteValue::Coil(values[0] != 0),
        )),
        (RegisterKind::Coil, _) => Ok((
            FunctionCode::WriteMultipleCoils,
            WriteValue::Coils(values.iter().map(|v| *v != 0).collect()),
        )),
        (RegisterKind::Holding, 1) => Ok((
            FunctionCode::WriteSingleRegister,
            WriteValue::Register(values[0]),
        )),
        (RegisterKind::Holding, _) => Ok((
            FunctionCode::WriteMultipleRegisters,
            WriteValue::Registers(values.to_vec()),
        )),
        _ => anyhow::bail!("only coil and holding registers are writable"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::ListPorts => {
            for port in list_ports()? {
                println!("{}", port.port_name);
            }
        }

        Commands::Read {
            link,
            slave,
            kind,
            address,
            quantity,
        } => {
            let client = link.open_client().await?;
            let request = ReadRequest::new(*slave, kind.read_function(), *address, *quantity);
            let response = client.read(request, ExchangeOptions::default()).await?;
            print_response(&response, cli.format)?;
            client.disconnect().await?;
        }

        Commands::Write {
            link,
            slave,
            kind,
            address,
            values,
        } => {
            let (function, value) = build_write_value(*kind, values)?;
            let client = link.open_client().await?;
            let request = WriteRequest::new(*slave, function, *address, value);
            client.write(request, ExchangeOptions::default()).await?;
            if matches!(cli.format, OutputFormat::Text) {
                println!("ok");
            }
            client.disconnect().await?;
        }

        Commands::Monitor {
            link,
            slave,
            kind,
            address,
            quantity,
            interval,
            count,
        } => {
            let client = link.open_client().await?;
            let mut events = client.subscribe();
            let request = ReadRequest::new(*slave, kind.read_function(), *address, *quantity);
            client.start_monitoring(request, Duration::from_millis(*interval));

            let mut seen = 0u64;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(ClientEvent::Response(response)) => {
                            print_response(&response, cli.format)?;
                            seen += 1;
                            if count.is_some_and(|limit| seen >= limit) {
                                break;
                            }
                        }
                        Ok(ClientEvent::Error(error)) => eprintln!("error: {error}"),
                        Ok(ClientEvent::RequestOutbound(_)) => {}
                        Err(_) => break,
                    }
                }
            }

            client.stop_monitoring();
            client.disconnect().await?;
        }
    }

    Ok(())
}
