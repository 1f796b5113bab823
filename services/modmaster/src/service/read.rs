//! Read orchestrator

use std::time::Instant;

use chrono::Utc;
use tracing::debug;

use super::Service;
use crate::core::decoders::decode_values;
use crate::core::events::Event;
use crate::core::logs::Direction;
use crate::core::read::{ReadKind, ReadRequest, ReadResult, RegisterType};
use crate::error::{ModmasterError, ReadFailure};

impl Service {
    /// Execute one read against the current connection
    ///
    /// Fails with [`ModmasterError::NotConnected`] without touching the
    /// transport when no client is held. Every outcome updates the stats and
    /// is published as a `data` or `error` event. A connection-class
    /// transport error also schedules a reconnect.
    pub async fn read(&self, request: ReadRequest) -> Result<ReadResult, ReadFailure> {
        let started = Instant::now();
        let mut result = ReadResult::for_request(&request);

        let (client, config, generation) = {
            let state = self.inner.state.lock();
            (state.client.clone(), state.config.clone(), state.generation)
        };

        let Some(client) = client else {
            return Err(self.fail_read(result, started, ModmasterError::NotConnected, None));
        };
        if request.quantity == 0 {
            let err = ModmasterError::invalid_input("quantity must be 1-65535");
            return Err(self.fail_read(result, started, err, None));
        }

        let unit_id = if request.unit_id != 0 {
            request.unit_id
        } else {
            config.unit_id
        };
        if let Err(e) = client.set_unit_id(unit_id).await {
            debug!(unit_id, error = %e, "Setting unit id failed");
        }

        let address = config.address_base.to_wire(request.address);
        self.log(
            Direction::Tx,
            format!(
                "tx {} fc={} addr=0x{:04x} qty=0x{:04x} unit=0x{:02x}",
                request.kind,
                request.kind.function_code(),
                address,
                request.quantity,
                unit_id
            ),
        );

        let quantity = request.quantity;
        let outcome = match request.kind {
            ReadKind::Coils => client
                .read_coils(address, quantity)
                .await
                .map(|values| result.bool_values = values),
            ReadKind::DiscreteInputs => client
                .read_discrete_inputs(address, quantity)
                .await
                .map(|values| result.bool_values = values),
            ReadKind::HoldingRegisters => client
                .read_registers(address, quantity, RegisterType::Holding)
                .await
                .map(|values| result.reg_values = values),
            ReadKind::InputRegisters => client
                .read_registers(address, quantity, RegisterType::Input)
                .await
                .map(|values| result.reg_values = values),
        };

        if let Err(err) = outcome {
            return Err(self.fail_read(
                result,
                started,
                ModmasterError::Transport(err),
                Some(generation),
            ));
        }

        if !result.reg_values.is_empty() {
            result.decoded = decode_values(&result.reg_values, &config.decoders);
        }
        result.completed_at = Utc::now();
        result.latency_ms = elapsed_ms(started);

        self.update_stats(result.latency_ms, false);
        self.log(
            Direction::Rx,
            format!(
                "rx {} fc={} addr=0x{:04x} qty=0x{:04x} latency={}ms",
                result.kind,
                result.kind.function_code(),
                result.address,
                result.quantity,
                result.latency_ms
            ),
        );
        self.inner.events.publish(Event::Data(result.clone()));

        Ok(result)
    }

    /// Stamp, count, log and publish a failed read
    ///
    /// `generation` is set only for errors raised by a transport call.
    fn fail_read(
        &self,
        mut result: ReadResult,
        started: Instant,
        error: ModmasterError,
        generation: Option<u64>,
    ) -> ReadFailure {
        result.completed_at = Utc::now();
        result.latency_ms = elapsed_ms(started);
        result.error_message = Some(error.to_string());
        result.error_kind = Some(error.kind());

        self.update_stats(result.latency_ms, true);
        self.log_err(error.to_string());
        self.inner.events.publish(Event::Error(result.clone()));

        if let (ModmasterError::Transport(transport), Some(generation)) = (&error, generation) {
            self.maybe_reconnect(transport, generation);
        }

        ReadFailure { result, error }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
