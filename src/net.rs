// src/net.rs

//! UDP ingest: tagged datagrams carrying either a raw RGB image line or an
//! IMU sample. The socket thread decodes, runs the preprocessor (this is the
//! non-RT producer of the shared snapshot), and stores IMU data for
//! consumers. A short read timeout keeps the running flag honored.

use crate::config::Config;
use crate::logging::{DiagKind, DiagSender, DiagSource};
use crate::params::Params;
use crate::preprocess::{ImuSample, Preprocessor, SharedLine};
use anyhow::{Context, Result};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TAG_IMAGE: u8 = 0x01;
pub const TAG_IMU: u8 = 0x02;

const IMU_PAYLOAD_BYTES: usize = 9 * 4;
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// A decoded datagram, borrowing the receive buffer.
pub enum Packet<'a> {
    Image {
        r: &'a [u8],
        g: &'a [u8],
        b: &'a [u8],
    },
    Imu(ImuSample),
}

/// Decodes one datagram. Image packets are `tag + R[L] + G[L] + B[L]`; IMU
/// packets are `tag + 9 little-endian f32` (accel, gyro, integrated angles).
pub fn decode_packet(buf: &[u8], pixels_per_line: usize) -> Option<Packet<'_>> {
    let (&tag, payload) = buf.split_first()?;
    match tag {
        TAG_IMAGE => {
            if payload.len() != pixels_per_line * 3 {
                return None;
            }
            let (r, gb) = payload.split_at(pixels_per_line);
            let (g, b) = gb.split_at(pixels_per_line);
            Some(Packet::Image { r, g, b })
        }
        TAG_IMU => {
            if payload.len() != IMU_PAYLOAD_BYTES {
                return None;
            }
            let mut values = [0.0f32; 9];
            for (i, chunk) in payload.chunks_exact(4).enumerate() {
                values[i] = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            Some(Packet::Imu(ImuSample {
                accel: [values[0], values[1], values[2]],
                gyro: [values[3], values[4], values[5]],
                angles: [values[6], values[7], values[8]],
            }))
        }
        _ => None,
    }
}

/// Binds the ingest socket. Separate from the run loop so startup can fail
/// loudly before any thread is spawned.
pub fn bind_socket(cfg: &Config) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(&cfg.udp_listen_addr)
        .with_context(|| format!("binding UDP socket on {}", cfg.udp_listen_addr))?;
    socket
        .set_read_timeout(Some(READ_TIMEOUT))
        .context("setting UDP read timeout")?;
    println!("Listening for image lines on {}", cfg.udp_listen_addr);
    Ok(socket)
}

/// Thread body: receive, decode, preprocess, publish.
pub fn run_ingest(
    socket: UdpSocket,
    cfg: Config,
    shared: Arc<SharedLine>,
    params: Arc<Params>,
    diag: DiagSender,
    running: Arc<AtomicBool>,
) {
    let mut pre = Preprocessor::new(&cfg, shared.clone());
    let mut buf = vec![0u8; cfg.pixels_per_line * 3 + 64];

    while running.load(Ordering::Relaxed) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _addr)) => len,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                eprintln!("udp receive error: {}", e);
                continue;
            }
        };

        match decode_packet(&buf[..len], cfg.pixels_per_line) {
            Some(Packet::Image { r, g, b }) => {
                pre.process_line(r, g, b, params.spectral_enabled());
            }
            Some(Packet::Imu(sample)) => {
                shared.set_imu(sample);
            }
            None => {
                diag.report(DiagSource::Udp, DiagKind::BadPacket);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_packet(l: usize) -> Vec<u8> {
        let mut buf = vec![TAG_IMAGE];
        buf.extend(std::iter::repeat(10u8).take(l)); // R
        buf.extend(std::iter::repeat(20u8).take(l)); // G
        buf.extend(std::iter::repeat(30u8).take(l)); // B
        buf
    }

    #[test]
    fn decodes_image_packet() {
        let buf = image_packet(16);
        match decode_packet(&buf, 16) {
            Some(Packet::Image { r, g, b }) => {
                assert_eq!(r.len(), 16);
                assert!(r.iter().all(|&x| x == 10));
                assert!(g.iter().all(|&x| x == 20));
                assert!(b.iter().all(|&x| x == 30));
            }
            _ => panic!("expected image packet"),
        }
    }

    #[test]
    fn decodes_imu_packet() {
        let mut buf = vec![TAG_IMU];
        let values: [f32; 9] = [0.1, 0.2, 0.3, 1.0, 2.0, 3.0, -0.5, 0.5, 1.5];
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        match decode_packet(&buf, 16) {
            Some(Packet::Imu(sample)) => {
                assert_eq!(sample.accel, [0.1, 0.2, 0.3]);
                assert_eq!(sample.gyro, [1.0, 2.0, 3.0]);
                assert_eq!(sample.angles, [-0.5, 0.5, 1.5]);
            }
            _ => panic!("expected imu packet"),
        }
    }

    #[test]
    fn rejects_truncated_and_unknown_packets() {
        let mut buf = image_packet(16);
        buf.pop();
        assert!(decode_packet(&buf, 16).is_none());
        assert!(decode_packet(&[0x7F, 0, 0], 16).is_none());
        assert!(decode_packet(&[], 16).is_none());
        assert!(decode_packet(&[TAG_IMU, 1, 2, 3], 16).is_none());
    }
}
