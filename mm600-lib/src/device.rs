use crate::channel::ByteChannel;
use crate::constants::{ENDPOINT_IN, ENDPOINT_OUT, PID, USB_BLOCK_SIZE, VID};
use crate::error::PumpError;
use async_trait::async_trait;
use bytes::Bytes;
use nusb::{Interface, transfer::RequestBuffer};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// The Contour Next Link 2.4 over USB HID interrupt endpoints.
#[derive(Default)]
pub struct UsbChannel {
    interface: Option<Interface>,
}

impl UsbChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the bridge, claim it and return a connected channel.
    pub async fn open() -> Result<Self, PumpError> {
        let mut channel = Self::new();
        channel.connect().await?;
        Ok(channel)
    }

    pub fn is_connected(&self) -> bool {
        self.interface.is_some()
    }

    fn interface(&self) -> Result<&Interface, PumpError> {
        self.interface
            .as_ref()
            .ok_or_else(|| PumpError::InvalidState("USB channel is not connected".to_string()))
    }
}

#[async_trait]
impl ByteChannel for UsbChannel {
    async fn connect(&mut self) -> Result<(), PumpError> {
        if self.interface.is_some() {
            return Ok(());
        }
        info!("Searching for Contour Next Link 2.4...");
        let device_info = nusb::list_devices()?
            .find(|d| d.vendor_id() == VID && d.product_id() == PID)
            .ok_or(PumpError::DeviceNotFound)?;

        info!(
            "Found device on bus {} addr {}",
            device_info.bus_number(),
            device_info.device_address()
        );

        let device = device_info.open()?;
        let interface = device.detach_and_claim_interface(0)?;
        info!("Interface claimed successfully.");
        self.interface = Some(interface);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), PumpError> {
        if self.interface.take().is_some() {
            info!("Released Contour Next Link 2.4");
        }
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), PumpError> {
        let transfer = self.interface()?.interrupt_out(ENDPOINT_OUT, bytes.to_vec());
        let completion = timeout(WRITE_TIMEOUT, transfer).await?;
        let sent = completion.into_result()?;
        debug!("Sent {} bytes", sent.actual_length());
        Ok(())
    }

    async fn receive_with_timeout(&mut self, wait: Duration) -> Result<Bytes, PumpError> {
        let transfer = self
            .interface()?
            .interrupt_in(ENDPOINT_IN, RequestBuffer::new(USB_BLOCK_SIZE));
        // dropping the pending transfer cancels it
        let Ok(completion) = timeout(wait, transfer).await else {
            return Ok(Bytes::new());
        };
        let report = completion.into_result()?;
        Ok(Bytes::from(report))
    }
}
