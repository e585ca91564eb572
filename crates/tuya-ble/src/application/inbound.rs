//! Inbound frame dispatch.
//!
//! Runs on the link's event task.  Each notification is fed to the
//! reassembler; a completed envelope is decrypted and handled by code.
//! Undecodable input is logged and dropped, it never tears the link down.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, warn};
use tuya_ble_core::protocol::codec::{open, Frame};
use tuya_ble_core::protocol::dp_payload::{parse_inbound, InboundDatapoints};
use tuya_ble_core::protocol::messages::{
    format_version, normalize_pair_result, Code, DeviceInfo, PAIR_RESULT_ALREADY_PAIRED,
};
use tuya_ble_core::protocol::time_sync::{time1_response, time2_response};
use tuya_ble_core::{Datapoint, ProtocolError};

use crate::application::connection::LinkEvent;
use crate::application::device::{lock, DeviceError, DeviceInner, Outcome};

impl DeviceInner {
    pub(super) fn handle_notification(self: &Arc<Self>, packet: &[u8]) {
        let envelope = match lock(&self.reassembler).push(packet) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(e) => {
                error!("{}: dropping malformed packet: {e}", self.address);
                return;
            }
        };

        let opened = {
            let session = lock(&self.session);
            open(&envelope, &session.keys)
        };
        let (flag, frame) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                error!("{}: dropping undecodable frame: {e}", self.address);
                return;
            }
        };

        let Some(code) = frame.known_code() else {
            debug!(
                "{}: received unknown message: #{} 0x{:04X}, response to #{}",
                self.address, frame.seq, frame.code, frame.response_to
            );
            return;
        };
        if frame.response_to > 0 {
            debug!(
                "{}: received: #{} {code:?} ({flag:?}), response to #{}",
                self.address, frame.seq, frame.response_to
            );
        } else {
            debug!("{}: received: #{} {code:?} ({flag:?})", self.address, frame.seq);
        }

        let outcome = self.dispatch(code, &frame);
        if frame.response_to > 0 && !lock(&self.pending).resolve(frame.response_to, outcome) {
            debug!(
                "{}: no request waiting for #{}",
                self.address, frame.response_to
            );
        }
    }

    /// Handles one frame; the result is what a waiting request sees.
    fn dispatch(self: &Arc<Self>, code: Code, frame: &Frame) -> Outcome {
        let payload = frame.payload.as_slice();
        match code {
            Code::DeviceInfo => self.on_device_info(payload),
            Code::Pair => {
                let raw = single_byte(payload)?;
                if raw == PAIR_RESULT_ALREADY_PAIRED {
                    debug!("{}: device is already paired", self.address);
                }
                match normalize_pair_result(raw) {
                    0 => {
                        self.transition(LinkEvent::PairAcknowledged);
                        Ok(())
                    }
                    code => Err(DeviceError::Device { code }),
                }
            }
            Code::DeviceStatus | Code::SendDps | Code::Unbind | Code::DeviceReset => {
                match single_byte(payload)? {
                    0 => Ok(()),
                    code => Err(DeviceError::Device { code }),
                }
            }
            Code::ReceiveTime1Request | Code::ReceiveTime2Request => {
                self.answer_time_request(code, frame.seq, payload);
                Ok(())
            }
            Code::ReceiveDp
            | Code::ReceiveTimeDp
            | Code::ReceiveSignDp
            | Code::ReceiveSignTimeDp => {
                self.on_datapoints(code, frame.seq, payload);
                Ok(())
            }
        }
    }

    fn on_device_info(&self, payload: &[u8]) -> Outcome {
        let info = DeviceInfo::parse(payload)?;
        {
            let mut session = lock(&self.session);
            session.keys.apply_device_info(&info);
            session.device_version = format_version(info.device_version);
            session.protocol_version_str = format_version(info.protocol_version);
            session.hardware_version = format_version(info.hardware_version);
            session.protocol_version = info.protocol_version.0;
            session.flags = info.flags;
            session.is_bound = info.is_bound;
            debug!(
                "{}: device version {}, protocol version {}, hardware version {}",
                self.address,
                session.device_version,
                session.protocol_version_str,
                session.hardware_version
            );
        }
        self.transition(LinkEvent::DeviceInfoReceived);
        Ok(())
    }

    fn answer_time_request(self: &Arc<Self>, code: Code, seq: u32, payload: &[u8]) {
        if !payload.is_empty() {
            warn!(
                "{}: ignoring {code:?} #{seq} with unexpected {}-byte payload",
                self.address,
                payload.len()
            );
            return;
        }
        let now = chrono::Local::now();
        let response = if code == Code::ReceiveTime1Request {
            time1_response(&now)
        } else {
            time2_response(&now)
        };
        debug!("{}: answering {code:?} #{seq} with local time {now}", self.address);
        self.spawn_response(code, response, seq);
    }

    fn on_datapoints(self: &Arc<Self>, code: Code, seq: u32, payload: &[u8]) {
        let InboundDatapoints {
            timestamp,
            flags,
            updates,
            ack_payload,
        } = match parse_inbound(code, payload, Utc::now()) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return,
            Err(e) => {
                error!("{}: dropping malformed datapoints #{seq}: {e}", self.address);
                return;
            }
        };

        let touched: Vec<Datapoint> = {
            let mut store = lock(&self.store);
            updates
                .into_iter()
                .map(|(id, value)| {
                    let dp = store.apply_from_device(id, timestamp, flags, value);
                    debug!("{}: datapoint {id} = {:?}", self.address, dp.value);
                    dp.clone()
                })
                .collect()
        };

        if !touched.is_empty() {
            self.listeners.fire_datapoints(&touched);
        }
        self.spawn_response(code, ack_payload, seq);
    }
}

/// Payload of a one-byte result response.
fn single_byte(payload: &[u8]) -> Result<u8, DeviceError> {
    match payload {
        [result] => Ok(*result),
        _ => Err(ProtocolError::Length {
            declared: 1,
            available: payload.len(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_byte_accepts_exactly_one_byte() {
        assert_eq!(single_byte(&[7]).unwrap(), 7);
        assert!(matches!(
            single_byte(&[]),
            Err(DeviceError::Protocol(ProtocolError::Length { declared: 1, available: 0 }))
        ));
        assert!(single_byte(&[0, 0]).is_err());
    }
}
