//! Packet processors
//!
//! One reaction per control opcode the client consumes. Identify and Resume
//! are outbound only and have no processor; any other opcode without one is
//! ignored by the receive loop.

use super::{Shard, ShardPhase};
use crate::error::GatewayError;
use crate::protocol::{Hello, OpCode, Payload, Ready, READY_EVENT, RESUMED_EVENT};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    Dispatch,
    Hello,
    HeartbeatRequest,
    Reconnect,
    InvalidSession,
    HeartbeatAck,
}

impl Processor {
    /// Processor for an inbound opcode, if the client reacts to it
    pub fn for_opcode(op: u64) -> Option<Self> {
        match OpCode::from_u8(u8::try_from(op).ok()?)? {
            OpCode::Dispatch => Some(Self::Dispatch),
            OpCode::Hello => Some(Self::Hello),
            OpCode::Heartbeat => Some(Self::HeartbeatRequest),
            OpCode::Reconnect => Some(Self::Reconnect),
            OpCode::InvalidSession => Some(Self::InvalidSession),
            OpCode::HeartbeatAck => Some(Self::HeartbeatAck),
            OpCode::Identify | OpCode::Resume => None,
        }
    }

    pub fn opcode(self) -> OpCode {
        match self {
            Self::Dispatch => OpCode::Dispatch,
            Self::Hello => OpCode::Hello,
            Self::HeartbeatRequest => OpCode::Heartbeat,
            Self::Reconnect => OpCode::Reconnect,
            Self::InvalidSession => OpCode::InvalidSession,
            Self::HeartbeatAck => OpCode::HeartbeatAck,
        }
    }

    /// React to one inbound payload. An error ends the current connection.
    pub async fn process(self, shard: &Arc<Shard>, payload: Payload) -> Result<(), GatewayError> {
        match self {
            Self::Dispatch => dispatch(shard, payload).await,
            Self::Hello => hello(shard, &payload).await,
            Self::HeartbeatRequest => {
                debug!(shard_id = shard.id().number(), "Heartbeat requested by peer");
                shard.heartbeat().await
            }
            Self::Reconnect => {
                info!(shard_id = shard.id().number(), "Reconnect requested by peer");
                shard.session().set_should_resume(true);
                shard.transport().close().await;
                Err(GatewayError::ReconnectRequested {
                    shard_id: shard.id().number(),
                })
            }
            Self::InvalidSession => {
                info!(
                    shard_id = shard.id().number(),
                    resumable = payload.raw_data(),
                    "Session invalidated by peer"
                );
                shard.session().set_should_resume(false);
                shard.transport().close().await;
                Err(GatewayError::SessionInvalidated {
                    shard_id: shard.id().number(),
                })
            }
            Self::HeartbeatAck => {
                shard.heartbeat_ack();
                Ok(())
            }
        }
    }
}

async fn dispatch(shard: &Arc<Shard>, payload: Payload) -> Result<(), GatewayError> {
    let shard_id = shard.id().number();

    match payload.event_name() {
        READY_EVENT => {
            let ready: Ready = payload.data()?;
            info!(
                shard_id,
                session_id = %ready.session_id,
                resume_url = ready.resume_gateway_url.as_deref().unwrap_or_default(),
                "Shard ready"
            );
            shard.session().set_session(ready.session_id, ready.resume_gateway_url);
            shard.session().set_identified();
            shard.set_phase(ShardPhase::Steady);
        }
        RESUMED_EVENT => {
            info!(shard_id, seq = shard.last_sequence(), "Shard resumed");
            shard.session().set_identified();
            shard.set_phase(ShardPhase::Steady);
        }
        _ => {}
    }

    let event = payload.event_name().to_string();
    let data = payload.raw_data().as_bytes().to_vec();
    shard.forward(event, data).await;
    Ok(())
}

async fn hello(shard: &Arc<Shard>, payload: &Payload) -> Result<(), GatewayError> {
    let hello: Hello = payload.data()?;
    shard.session().set_hello_received();

    let interval = Duration::from_millis(hello.heartbeat_interval.max(1));
    debug!(
        shard_id = shard.id().number(),
        interval_ms = hello.heartbeat_interval,
        "Hello received"
    );
    shard.start_heartbeat(interval);

    if shard.session().can_resume() {
        shard.resume().await
    } else {
        shard.identify().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_opcodes_have_processors() {
        for (op, processor) in [
            (0, Processor::Dispatch),
            (1, Processor::HeartbeatRequest),
            (7, Processor::Reconnect),
            (9, Processor::InvalidSession),
            (10, Processor::Hello),
            (11, Processor::HeartbeatAck),
        ] {
            assert_eq!(Processor::for_opcode(op), Some(processor));
            assert_eq!(u64::from(processor.opcode().as_u8()), op);
        }
    }

    #[test]
    fn outbound_and_unknown_opcodes_have_none() {
        assert_eq!(Processor::for_opcode(2), None);
        assert_eq!(Processor::for_opcode(6), None);
        assert_eq!(Processor::for_opcode(3), None);
        assert_eq!(Processor::for_opcode(255), None);
        assert_eq!(Processor::for_opcode(256 + 11), None);
        assert_eq!(Processor::for_opcode(u64::MAX), None);
    }
}
