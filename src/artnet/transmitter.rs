use bytes::Bytes;
use error_stack::{Result, ResultExt};
use std::{
    collections::HashMap,
    net::{IpAddr, UdpSocket},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

use super::ArtnetError;
use crate::stage::model::Device;

const ARTNET_PORT: u16 = 6454;
const ARTNET_HEADER: &[u8; 8] = b"Art-Net\0";
const OPCODE_DMX: u16 = 0x5000;
const PROTOCOL_VERSION: u16 = 14;
pub(crate) const DMX_DATA_OFFSET: usize = 18;
const DMX_PAYLOAD_LEN: usize = 512;
const SEND_TIMEOUT: Duration = Duration::from_secs(1);
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(10);
const ERRORS_BEFORE_REBUILD: u32 = 5;

/// Art-Net DMX transmitter with per-universe sequence counters, a per-device
/// dedup cache of the last sent frame and socket recovery after repeated
/// send failures.
///
/// The emitted frame always carries the full 512-channel payload. Channels
/// outside the sending device's `start_channel..start_channel+channel_count`
/// window are zero, so two devices sharing an (ip, universe) pair overwrite
/// each other's off-window channels. One device per universe is the
/// supported topology.
#[derive(Debug)]
pub struct Transmitter {
    socket: UdpSocket,
    sequences: HashMap<(IpAddr, u16), u8>,
    last_sent: HashMap<String, Bytes>,
    error_count: u32,
    last_error_log: Option<Instant>,
    disable_send: bool,
    #[cfg(test)]
    pub(crate) sent_log: Vec<(IpAddr, Vec<u8>)>,
}

impl Transmitter {
    pub fn new(disable_send: bool) -> Result<Transmitter, ArtnetError> {
        let socket = init_socket()?;
        info!("Art-Net socket initialized");

        Ok(Transmitter {
            socket,
            sequences: HashMap::new(),
            last_sent: HashMap::new(),
            error_count: 0,
            last_error_log: None,
            disable_send,
            #[cfg(test)]
            sent_log: Vec::new(),
        })
    }

    /// Send the device's current values as one Art-Net frame. Never raises:
    /// failures are counted and absorbed, and the socket is rebuilt after
    /// five consecutive errors.
    pub fn send_device(&mut self, device: &Device) -> bool {
        let mut channels = [0u8; DMX_PAYLOAD_LEN];
        for (i, value) in device.values.iter().enumerate() {
            let position = (device.start_channel as usize).saturating_sub(1) + i;
            if position < DMX_PAYLOAD_LEN {
                channels[position] = *value;
            }
        }

        if let Some(last) = self.last_sent.get(&device.id) {
            if last[..] == channels[..] {
                debug!("DMX cache hit for {}, skipping send", device.name);
                return true;
            }
        }

        let sequence = self.next_sequence(device.ip, device.universe);
        let frame = build_frame(device.universe, sequence, &channels);

        match self.transmit(device.ip, &frame) {
            Ok(()) => {
                if self.error_count > 0 {
                    info!("Art-Net communication recovered for {}", device.ip);
                    self.error_count = 0;
                }
                self.last_sent
                    .insert(device.id.clone(), Bytes::copy_from_slice(&channels));
                true
            }
            Err(e) => {
                self.note_send_error(device.ip, e);
                false
            }
        }
    }

    /// Drop the dedup cache entry for a removed device.
    pub fn forget_device(&mut self, device_id: &str) {
        self.last_sent.remove(device_id);
    }

    pub(super) fn next_sequence(&mut self, ip: IpAddr, universe: u16) -> u8 {
        let counter = self.sequences.entry((ip, universe)).or_insert(0);
        *counter = if *counter == 255 { 1 } else { *counter + 1 };
        *counter
    }

    fn transmit(&mut self, ip: IpAddr, frame: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        self.sent_log.push((ip, frame.to_vec()));

        if self.disable_send {
            return Ok(());
        }

        self.socket.send_to(frame, (ip, ARTNET_PORT))?;
        Ok(())
    }

    fn note_send_error(&mut self, ip: IpAddr, e: std::io::Error) {
        self.error_count += 1;

        let now = Instant::now();
        if self
            .last_error_log
            .map_or(true, |t| now.duration_since(t) > ERROR_LOG_INTERVAL)
        {
            error!(
                "DMX socket error to {}: {} (count: {})",
                ip, e, self.error_count
            );
            self.last_error_log = Some(now);
        }

        if self.error_count >= ERRORS_BEFORE_REBUILD {
            warn!("Attempting to reinitialize Art-Net socket");
            match init_socket() {
                Ok(socket) => {
                    self.socket = socket;
                    // A fresh socket means the receiver may have missed
                    // frames; the dedup cache can no longer be trusted.
                    self.last_sent.clear();
                    self.error_count = 0;
                    info!("Art-Net socket reinitialized");
                }
                Err(reinit_error) => error!("Socket reinit failed: {:?}", reinit_error),
            }
        }
    }
}

fn init_socket() -> Result<UdpSocket, ArtnetError> {
    let into_context = || ArtnetError::Context(String::from("Creating Art-Net socket"));

    let socket = UdpSocket::bind("0.0.0.0:0").change_context_lazy(into_context)?;
    socket.set_broadcast(true).change_context_lazy(into_context)?;
    socket
        .set_write_timeout(Some(SEND_TIMEOUT))
        .change_context_lazy(into_context)?;

    Ok(socket)
}

pub(super) fn build_frame(universe: u16, sequence: u8, channels: &[u8; DMX_PAYLOAD_LEN]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(DMX_DATA_OFFSET + DMX_PAYLOAD_LEN);

    frame.extend_from_slice(ARTNET_HEADER);
    frame.push((OPCODE_DMX & 0xff) as u8);
    frame.push((OPCODE_DMX >> 8) as u8);
    frame.push((PROTOCOL_VERSION >> 8) as u8); // Protocol version Hi
    frame.push((PROTOCOL_VERSION & 0xff) as u8); // Protocol version Lo
    frame.push(sequence);
    frame.push(0x00); // Physical
    frame.push((universe & 0xff) as u8); // Universe Lo
    frame.push((universe >> 8) as u8); // Universe Hi
    frame.push((DMX_PAYLOAD_LEN >> 8) as u8); // Length Hi
    frame.push((DMX_PAYLOAD_LEN & 0xff) as u8); // Length Lo

    debug_assert_eq!(frame.len(), DMX_DATA_OFFSET);
    frame.extend_from_slice(channels);
    frame
}
