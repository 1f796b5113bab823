//! `tokio-modbus` backed client for TCP and RTU links

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_modbus::client::{rtu, tcp, Client, Context, Reader};
use tokio_modbus::slave::{Slave, SlaveContext};
use tokio_modbus::ExceptionCode;
use tokio_serial::SerialStream;
use tracing::{debug, info};

use super::{ClientFactory, ModbusClient, TransportError};
use crate::config::{Parity, Protocol, SerialConfig, ServiceConfig};
use crate::core::read::RegisterType;

impl From<tokio_modbus::Error> for TransportError {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(io) => TransportError::Io(io),
            other => TransportError::Protocol(other.to_string()),
        }
    }
}

impl From<tokio_serial::Error> for TransportError {
    fn from(err: tokio_serial::Error) -> Self {
        TransportError::Serial(err.to_string())
    }
}

/// Where the client connects to
#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Tcp { host: String, port: u16 },
    Rtu(SerialConfig),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Endpoint::Rtu(serial) => write!(f, "rtu://{}", serial.device),
        }
    }
}

/// Client over a `tokio-modbus` context
///
/// The context is opened lazily by [`ModbusClient::open`] and guarded by an
/// async mutex, so concurrent reads queue on the single link.
pub struct TokioModbusClient {
    endpoint: Endpoint,
    timeout: Duration,
    unit_id: AtomicU8,
    ctx: Mutex<Option<Context>>,
}

impl TokioModbusClient {
    pub fn new(config: &ServiceConfig) -> Self {
        let endpoint = match config.protocol {
            Protocol::Tcp => Endpoint::Tcp {
                host: config.tcp.host.clone(),
                port: config.tcp.port,
            },
            Protocol::Rtu => Endpoint::Rtu(config.serial.clone()),
        };
        Self {
            endpoint,
            timeout: config.timeout(),
            unit_id: AtomicU8::new(config.unit_id),
            ctx: Mutex::new(None),
        }
    }

    async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        let mut addrs = tokio::net::lookup_host((host, port)).await?;
        addrs.next().ok_or_else(|| {
            TransportError::Config(format!("no address found for {}:{}", host, port))
        })
    }

    async fn connect(&self) -> Result<Context, TransportError> {
        let slave = Slave(self.unit_id.load(Ordering::Relaxed));
        match &self.endpoint {
            Endpoint::Tcp { host, port } => {
                let addr = Self::resolve(host, *port).await?;
                let ctx = tokio::time::timeout(self.timeout, tcp::connect_slave(addr, slave))
                    .await
                    .map_err(|_| TransportError::Timeout(self.timeout))??;
                Ok(ctx)
            },
            Endpoint::Rtu(serial) => {
                let builder = tokio_serial::new(&serial.device, serial.speed)
                    .parity(serial_parity(serial.parity))
                    .stop_bits(serial_stop_bits(serial.stop_bits)?)
                    .data_bits(serial_data_bits(serial.data_bits)?)
                    .timeout(self.timeout);
                let port = SerialStream::open(&builder)?;
                Ok(rtu::attach_slave(port, slave))
            },
        }
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, TransportError>
    where
        F: std::future::Future<
            Output = Result<Result<T, ExceptionCode>, tokio_modbus::Error>,
        >,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Err(_) => Err(TransportError::Timeout(self.timeout)),
            Ok(Err(err)) => Err(err.into()),
            Ok(Ok(Err(code))) => Err(TransportError::Exception(format!("{:?}", code))),
            Ok(Ok(Ok(values))) => Ok(values),
        }
    }
}

#[async_trait]
impl ModbusClient for TokioModbusClient {
    async fn open(&self) -> Result<(), TransportError> {
        let ctx = self.connect().await?;
        let previous = self.ctx.lock().await.replace(ctx);
        if let Some(mut previous) = previous {
            if let Err(e) = previous.disconnect().await {
                debug!(endpoint = %self.endpoint, error = %e, "Closing replaced link failed");
            }
        }
        info!("Opened {}", self.endpoint);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let ctx = self.ctx.lock().await.take();
        match ctx {
            Some(mut ctx) => {
                debug!("Closing {}", self.endpoint);
                ctx.disconnect().await.map_err(TransportError::from)
            },
            None => Ok(()),
        }
    }

    async fn set_unit_id(&self, unit_id: u8) -> Result<(), TransportError> {
        self.unit_id.store(unit_id, Ordering::Relaxed);
        if let Some(ctx) = self.ctx.lock().await.as_mut() {
            ctx.set_slave(Slave(unit_id));
        }
        Ok(())
    }

    async fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, TransportError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(TransportError::Closed)?;
        let mut values = self
            .with_timeout(ctx.read_coils(address, quantity))
            .await?;
        values.truncate(usize::from(quantity));
        Ok(values)
    }

    async fn read_discrete_inputs(
        &self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(TransportError::Closed)?;
        let mut values = self
            .with_timeout(ctx.read_discrete_inputs(address, quantity))
            .await?;
        values.truncate(usize::from(quantity));
        Ok(values)
    }

    async fn read_registers(
        &self,
        address: u16,
        quantity: u16,
        register_type: RegisterType,
    ) -> Result<Vec<u16>, TransportError> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(TransportError::Closed)?;
        match register_type {
            RegisterType::Holding => {
                self.with_timeout(ctx.read_holding_registers(address, quantity))
                    .await
            },
            RegisterType::Input => {
                self.with_timeout(ctx.read_input_registers(address, quantity))
                    .await
            },
        }
    }
}

fn serial_parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

fn serial_stop_bits(bits: u8) -> Result<tokio_serial::StopBits, TransportError> {
    match bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(TransportError::Config(format!(
            "unsupported stop bits: {}",
            other
        ))),
    }
}

fn serial_data_bits(bits: u8) -> Result<tokio_serial::DataBits, TransportError> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(TransportError::Config(format!(
            "unsupported data bits: {}",
            other
        ))),
    }
}

/// Factory producing [`TokioModbusClient`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioModbusFactory;

impl ClientFactory for TokioModbusFactory {
    fn create(&self, config: &ServiceConfig) -> Result<Arc<dyn ModbusClient>, TransportError> {
        match config.protocol {
            Protocol::Tcp if config.tcp.host.trim().is_empty() => {
                return Err(TransportError::Config("tcp host is empty".to_string()))
            },
            Protocol::Rtu => {
                if config.serial.device.trim().is_empty() {
                    return Err(TransportError::Config(
                        "serial device is empty".to_string(),
                    ));
                }
                serial_stop_bits(config.serial.stop_bits)?;
                serial_data_bits(config.serial.data_bits)?;
            },
            Protocol::Tcp => {},
        }
        Ok(Arc::new(TokioModbusClient::new(config)))
    }
}

/// A serial port found on this machine
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SerialDevice {
    pub path: String,
    pub description: Option<String>,
}

/// Enumerate serial devices usable for RTU
pub fn serial_devices() -> Result<Vec<SerialDevice>, TransportError> {
    let ports = tokio_serial::available_ports()?;
    let mut devices: Vec<SerialDevice> = ports
        .into_iter()
        .map(|port| {
            let description = match port.port_type {
                tokio_serial::SerialPortType::UsbPort(usb) => usb
                    .product
                    .or(usb.manufacturer)
                    .or_else(|| Some(format!("USB {:04x}:{:04x}", usb.vid, usb.pid))),
                tokio_serial::SerialPortType::PciPort => Some("PCI".to_string()),
                tokio_serial::SerialPortType::BluetoothPort => Some("Bluetooth".to_string()),
                tokio_serial::SerialPortType::Unknown => None,
            };
            SerialDevice {
                path: port.port_name,
                description,
            }
        })
        .collect();
    devices.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(devices)
}
