//! Scripted in-memory transport for service tests

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Integration test - unwrap is acceptable

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use modmaster::core::read::RegisterType;
use modmaster::runtime::ReconnectPolicy;
use modmaster::{ClientFactory, ModbusClient, Service, ServiceConfig, ServiceOptions, TransportError};

/// Shared script and call counters for every client a factory creates
#[derive(Default)]
pub struct MockDevice {
    pub open_attempts: AtomicUsize,
    pub open_times: Mutex<Vec<Instant>>,
    pub closes: AtomicUsize,
    pub transport_reads: AtomicUsize,
    /// Number of upcoming opens that fail; `usize::MAX` fails forever
    pub failing_opens: AtomicUsize,
    pub open_delay: Mutex<Duration>,
    pub registers: Mutex<Vec<u16>>,
    pub coils: Mutex<Vec<bool>>,
    pub read_errors: Mutex<VecDeque<TransportError>>,
    pub addresses: Mutex<Vec<u16>>,
    pub unit_ids: Mutex<Vec<u8>>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unreachable() -> Arc<Self> {
        let device = Self::default();
        device.failing_opens.store(usize::MAX, Ordering::SeqCst);
        Arc::new(device)
    }

    pub fn with_registers(registers: Vec<u16>) -> Arc<Self> {
        let device = Self::default();
        *device.registers.lock() = registers;
        Arc::new(device)
    }

    pub fn fail_next_read(&self, error: TransportError) {
        self.read_errors.lock().push_back(error);
    }

    pub fn opens(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.transport_reads.load(Ordering::SeqCst)
    }

    fn take_read(&self, address: u16) -> Result<(), TransportError> {
        self.transport_reads.fetch_add(1, Ordering::SeqCst);
        self.addresses.lock().push(address);
        match self.read_errors.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct MockClient {
    device: Arc<MockDevice>,
}

#[async_trait]
impl ModbusClient for MockClient {
    async fn open(&self) -> Result<(), TransportError> {
        self.device.open_times.lock().push(Instant::now());
        self.device.open_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.device.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.device.failing_opens.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        if remaining != usize::MAX {
            self.device.failing_opens.fetch_sub(1, Ordering::SeqCst);
        }
        Err(TransportError::Io(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        )))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.device.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_unit_id(&self, unit_id: u8) -> Result<(), TransportError> {
        self.device.unit_ids.lock().push(unit_id);
        Ok(())
    }

    async fn read_coils(&self, address: u16, quantity: u16) -> Result<Vec<bool>, TransportError> {
        self.device.take_read(address)?;
        let coils = self.device.coils.lock();
        Ok((0..usize::from(quantity))
            .map(|i| coils.get(i).copied().unwrap_or(false))
            .collect())
    }

    async fn read_discrete_inputs(
        &self,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<bool>, TransportError> {
        self.read_coils(address, quantity).await
    }

    async fn read_registers(
        &self,
        address: u16,
        quantity: u16,
        _register_type: RegisterType,
    ) -> Result<Vec<u16>, TransportError> {
        self.device.take_read(address)?;
        let registers = self.device.registers.lock();
        Ok((0..usize::from(quantity))
            .map(|i| registers.get(i).copied().unwrap_or(0))
            .collect())
    }
}

pub struct MockFactory {
    pub device: Arc<MockDevice>,
}

impl ClientFactory for MockFactory {
    fn create(&self, _config: &ServiceConfig) -> Result<Arc<dyn ModbusClient>, TransportError> {
        Ok(Arc::new(MockClient {
            device: Arc::clone(&self.device),
        }))
    }
}

/// Retry quickly so tests do not wait out real backoff
pub fn fast_options() -> ServiceOptions {
    ServiceOptions {
        reconnect: ReconnectPolicy::from_millis(10, 40, 2.0),
        ..ServiceOptions::default()
    }
}

pub fn service_with(device: &Arc<MockDevice>, config: ServiceConfig) -> Service {
    Service::with_factory(
        config,
        Arc::new(MockFactory {
            device: Arc::clone(device),
        }),
        fast_options(),
    )
}

pub fn service(device: &Arc<MockDevice>) -> Service {
    service_with(device, ServiceConfig::default())
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_for<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

pub async fn connected(service: &Service) {
    service.connect().unwrap();
    assert!(wait_for(|| service.is_connected()).await, "never connected");
}

pub fn count_logs(service: &Service, message: &str) -> usize {
    service
        .logs()
        .iter()
        .filter(|entry| entry.message == message)
        .count()
}

pub async fn with_deadline<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("operation did not finish in time")
}
