//! Bridge and session bound together: envelope, NGP and ComD exchanges.

use crate::channel::ByteChannel;
use crate::cipher;
use crate::config::DriverConfig;
use crate::constants::{ComDCommand, EnvelopeCommand, HighSpeedMode, NgpCommand, RADIO_CHANNELS};
use crate::envelope::{self, MinimedResponse, ReadInfo};
use crate::error::PumpError;
use crate::ngp::{self, ComDResponse, NgpResponse};
use crate::pairing::{PairingSession, PairingStep};
use crate::session::PumpSession;
use crate::transport::Bridge;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const NOT_LINKED_MESSAGE: &str =
    "Please make sure that the pump is paired with this Contour Next Link 2.4 and that the pump is in range";

pub const NOT_ASSOCIATED_MESSAGE: &str =
    "This Contour Next Link 2.4 is not linked to a pump. Link them, or give the pump serial number to pair";

/// The single logical connection to a pump through the bridge.
///
/// Every exchange takes `&mut self`, so only one request is ever in flight
/// and the sequence counters advance in wire order.
pub struct PumpLink<C: ByteChannel> {
    bridge: Bridge<C>,
    session: PumpSession,
    ngp_timeout: Duration,
    join_timeout: Duration,
    pairing_timeout: Duration,
}

impl<C: ByteChannel> PumpLink<C> {
    pub fn new(bridge: Bridge<C>, session: PumpSession, config: &DriverConfig) -> Self {
        Self {
            bridge,
            session,
            ngp_timeout: config.ngp_read_timeout(),
            join_timeout: config.join_timeout(),
            pairing_timeout: config.pairing_timeout(),
        }
    }

    pub fn session(&self) -> &PumpSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut PumpSession {
        &mut self.session
    }

    pub fn bridge_mut(&mut self) -> &mut Bridge<C> {
        &mut self.bridge
    }

    pub fn into_bridge(self) -> Bridge<C> {
        self.bridge
    }

    pub fn ngp_timeout(&self) -> Duration {
        self.ngp_timeout
    }

    async fn minimed_request(&mut self, command: EnvelopeCommand, payload: &[u8]) -> Result<MinimedResponse, PumpError> {
        let sequence = self.session.envelope_sequence.next_value();
        let message = envelope::build(command, sequence, payload);
        let timeout = self.bridge.read_timeout();
        let response = self.bridge.exchange(&message, timeout, Duration::ZERO).await?;
        MinimedResponse::parse(response)
    }

    pub async fn open_connection(&mut self) -> Result<(), PumpError> {
        let hmac = self.session.hmac();
        self.minimed_request(EnvelopeCommand::OpenConnection, &hmac).await?;
        Ok(())
    }

    pub async fn close_connection(&mut self) -> Result<(), PumpError> {
        let hmac = self.session.hmac();
        self.minimed_request(EnvelopeCommand::CloseConnection, &hmac).await?;
        Ok(())
    }

    /// READ_INFO; stores both MACs in the session.
    pub async fn read_info(&mut self) -> Result<ReadInfo, PumpError> {
        let response = self.minimed_request(EnvelopeCommand::ReadInfo, &[]).await?;
        let info = ReadInfo::parse(&response)?;
        self.session.link_mac = info.link_mac;
        self.session.pump_mac = info.pump_mac;
        info!("Link MAC {}, pump MAC {}", info.link_mac, info.pump_mac);
        Ok(info)
    }

    /// Fetch and unpack the stored link key into the session.
    pub async fn request_link_key(&mut self) -> Result<(), PumpError> {
        let response = self.minimed_request(EnvelopeCommand::RequestLinkKey, &[]).await?;
        let packed = envelope::packed_link_key(&response)?;
        let key = cipher::unpack_link_key(packed, self.session.model_and_serial.as_bytes())?;
        self.session.set_key(key);
        Ok(())
    }

    /// Send an NGP frame, read the SEND_MESSAGE_RESPONSE ack and optionally the
    /// RECEIVE_MESSAGE that follows.
    async fn ngp_request(
        &mut self,
        command: NgpCommand,
        payload: &[u8],
        timeout: Duration,
        await_response: bool,
    ) -> Result<Option<NgpResponse>, PumpError> {
        let sequence = self.session.envelope_sequence.next_value();
        let frame = ngp::build_frame(command, payload);
        let message = envelope::build(EnvelopeCommand::SendMessage, sequence, &frame);

        // The 0x81 acknowledgement carries nothing we act on.
        self.bridge.exchange(&message, timeout, Duration::ZERO).await?;
        if !await_response {
            return Ok(None);
        }
        self.read_receive_message(timeout).await.map(Some)
    }

    /// Read until a RECEIVE_MESSAGE envelope arrives, dropping anything else.
    pub async fn read_receive_message(&mut self, timeout: Duration) -> Result<NgpResponse, PumpError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let raw = self.bridge.read_message(remaining).await?;
            if envelope::declared_length(&raw).is_some() && raw.get(18) != Some(&u8::from(EnvelopeCommand::ReceiveMessage)) {
                debug!("Discarding envelope with command {:#04x}", raw[18]);
                continue;
            }
            return NgpResponse::parse(raw);
        }
    }

    pub async fn join_network(&mut self, radio_channel: u8) -> Result<u8, PumpError> {
        self.session.radio_channel = radio_channel;
        let payload = ngp::join_payload(&mut self.session);
        let response = self
            .ngp_request(NgpCommand::JoinNetwork, &payload, self.join_timeout, true)
            .await?
            .ok_or_else(|| PumpError::InvalidMessage("JOIN_NETWORK without response".to_string()))?;
        Ok(response.joined_channel())
    }

    /// Try each radio channel in turn until the pump answers on one.
    pub async fn negotiate_radio_channel(&mut self) -> Result<u8, PumpError> {
        for channel in RADIO_CHANNELS {
            match self.join_network(channel).await {
                Ok(0) => debug!("No pump on channel {:#04x}", channel),
                Ok(joined) => {
                    info!("Joined pump network on channel {:#04x}", joined);
                    self.session.radio_channel = channel;
                    return Ok(channel);
                }
                Err(e) if e.is_timeout() => debug!("Channel {:#04x} timed out", channel),
                Err(e) => return Err(e),
            }
        }
        self.session.radio_channel = 0;
        Err(PumpError::InvalidState(NOT_LINKED_MESSAGE.to_string()))
    }

    /// Encrypted ComD request, waiting for the decrypted answer.
    pub async fn comd_request(
        &mut self,
        command: ComDCommand,
        params: &[u8],
        timeout: Duration,
    ) -> Result<ComDResponse, PumpError> {
        let payload = ngp::transmit_payload(&mut self.session, command, params)?;
        let response = self
            .ngp_request(NgpCommand::TransmitPacket, &payload, timeout, true)
            .await?
            .ok_or_else(|| PumpError::InvalidMessage(format!("{} without response", command)))?;
        let comd = ComDResponse::for_session(&response, &self.session)?;
        debug!("ComD {} -> {}", command, comd.command());
        Ok(comd)
    }

    /// Encrypted ComD message that the pump does not answer directly.
    pub async fn comd_send(&mut self, command: ComDCommand, params: &[u8]) -> Result<(), PumpError> {
        let payload = ngp::transmit_payload(&mut self.session, command, params)?;
        self.ngp_request(NgpCommand::TransmitPacket, &payload, self.ngp_timeout, false)
            .await?;
        Ok(())
    }

    /// Next unsolicited ComD message from the pump.
    pub async fn comd_receive(&mut self, timeout: Duration) -> Result<ComDResponse, PumpError> {
        let response = self.read_receive_message(timeout).await?;
        ComDResponse::for_session(&response, &self.session)
    }

    /// Pair with the pump whose serial is `pump_serial` and store the link
    /// key it hands over.
    ///
    /// Joins the pump network with the MAC derived from the serial, then
    /// answers the pump's handshake messages until it ends initialization.
    /// Nothing here is retried: a silent pump fails the pairing.
    pub async fn pair(&mut self, pump_serial: &str) -> Result<PairingSession, PumpError> {
        let mut pairing = PairingSession::new(&self.session, pump_serial)?;
        self.session.pump_mac = pairing.pump_mac();
        self.negotiate_radio_channel().await?;

        loop {
            let response = self.read_receive_message(self.pairing_timeout).await.map_err(|e| {
                if e.is_timeout() {
                    PumpError::Pairing(format!("pump {} stopped answering: {}", pairing.pump_mac(), e))
                } else {
                    e
                }
            })?;
            match pairing.handle(ngp::clear_comd(&response)?)? {
                PairingStep::Reply(comd) => {
                    let payload = ngp::clear_transmit_payload(&mut self.session, &comd);
                    self.ngp_request(NgpCommand::TransmitPacket, &payload, self.ngp_timeout, false)
                        .await?;
                }
                PairingStep::Wait => {}
                PairingStep::Finished => break,
            }
        }

        pairing.apply(&mut self.session)?;
        Ok(pairing)
    }

    pub async fn set_high_speed_mode(&mut self, mode: HighSpeedMode) -> Result<(), PumpError> {
        self.comd_send(ComDCommand::HighSpeedMode, &[u8::from(mode)]).await
    }
}
