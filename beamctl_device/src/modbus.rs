//! Minimal Modbus-TCP client.
//!
//! Request/response over a [`Transport`], synchronous on the back-end
//! worker thread. Only the function codes the instrument needs are
//! implemented: read coils, read holding registers, write single coil,
//! write single register. A closed socket is a communication error and
//! escalates to a disconnect.

use std::time::{Duration, Instant};

use beamctl_common::error::DeviceError;

use crate::transport::Transport;

const FC_READ_COILS: u8 = 0x01;
const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
const FC_WRITE_SINGLE_COIL: u8 = 0x05;
const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Synchronous Modbus-TCP client.
pub struct ModbusClient {
    link: Box<dyn Transport>,
    unit_id: u8,
    transaction: u16,
    timeout: Duration,
    rx: Vec<u8>,
}

impl ModbusClient {
    pub fn new(link: Box<dyn Transport>, unit_id: u8, timeout: Duration) -> Self {
        Self {
            link,
            unit_id,
            transaction: 0,
            timeout,
            rx: Vec::new(),
        }
    }

    fn request(&mut self, pdu: &[u8]) -> Result<Vec<u8>, DeviceError> {
        self.transaction = self.transaction.wrapping_add(1);
        let mut frame = Vec::with_capacity(7 + pdu.len());
        frame.extend_from_slice(&self.transaction.to_be_bytes());
        frame.extend_from_slice(&[0, 0]); // protocol id
        frame.extend_from_slice(&((pdu.len() as u16 + 1).to_be_bytes()));
        frame.push(self.unit_id);
        frame.extend_from_slice(pdu);
        self.link.send(&frame)?;
        let reply = self.receive_reply()?;
        if reply.len() < 2 {
            return Err(DeviceError::Communication(
                "short Modbus reply".to_string(),
            ));
        }
        if reply[0] == pdu[0] | 0x80 {
            return Err(DeviceError::Device(format!(
                "Modbus exception {} for function {:#04x}",
                reply.get(1).copied().unwrap_or(0),
                pdu[0]
            )));
        }
        if reply[0] != pdu[0] {
            return Err(DeviceError::Communication(format!(
                "Modbus function mismatch: sent {:#04x}, got {:#04x}",
                pdu[0], reply[0]
            )));
        }
        Ok(reply)
    }

    /// Read a complete MBAP frame, returning its PDU.
    fn receive_reply(&mut self) -> Result<Vec<u8>, DeviceError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.rx.len() >= 7 {
                let length = u16::from_be_bytes([self.rx[4], self.rx[5]]) as usize;
                if length >= 1 && self.rx.len() >= 6 + length {
                    let frame: Vec<u8> = self.rx.drain(..6 + length).collect();
                    // Skip MBAP header and unit id.
                    return Ok(frame[7..].to_vec());
                }
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| {
                    DeviceError::Communication("Modbus reply timeout".to_string())
                })?;
            match self.link.recv(remaining.min(Duration::from_millis(50)))? {
                Some(bytes) => self.rx.extend_from_slice(&bytes),
                None => {
                    if Instant::now() >= deadline {
                        return Err(DeviceError::Communication(
                            "Modbus reply timeout".to_string(),
                        ));
                    }
                }
            }
        }
    }

    pub fn read_holding_registers(
        &mut self,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, DeviceError> {
        let mut pdu = vec![FC_READ_HOLDING_REGISTERS];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        let reply = self.request(&pdu)?;
        let nbytes = *reply.get(1).unwrap_or(&0) as usize;
        if reply.len() < 2 + nbytes || nbytes != count as usize * 2 {
            return Err(DeviceError::Communication(
                "malformed register read reply".to_string(),
            ));
        }
        Ok(reply[2..2 + nbytes]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    pub fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>, DeviceError> {
        let mut pdu = vec![FC_READ_COILS];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        let reply = self.request(&pdu)?;
        let nbytes = *reply.get(1).unwrap_or(&0) as usize;
        if reply.len() < 2 + nbytes {
            return Err(DeviceError::Communication(
                "malformed coil read reply".to_string(),
            ));
        }
        let mut coils = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let byte = reply.get(2 + i / 8).copied().unwrap_or(0);
            coils.push(byte & (1 << (i % 8)) != 0);
        }
        Ok(coils)
    }

    pub fn write_coil(&mut self, address: u16, value: bool) -> Result<(), DeviceError> {
        let mut pdu = vec![FC_WRITE_SINGLE_COIL];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(if value { &[0xff, 0x00] } else { &[0x00, 0x00] });
        self.request(&pdu).map(|_| ())
    }

    pub fn write_register(&mut self, address: u16, value: u16) -> Result<(), DeviceError> {
        let mut pdu = vec![FC_WRITE_SINGLE_REGISTER];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&value.to_be_bytes());
        self.request(&pdu).map(|_| ())
    }
}

/// A scripted Modbus server over a [`crate::transport::TransportPeer`],
/// for simulators and tests: holds coil and register images and answers
/// the four supported functions.
pub struct ModbusServerImage {
    pub coils: Vec<bool>,
    pub registers: Vec<u16>,
}

impl ModbusServerImage {
    pub fn new(ncoils: usize, nregisters: usize) -> Self {
        Self {
            coils: vec![false; ncoils],
            registers: vec![0; nregisters],
        }
    }

    /// Answer one request frame; returns the full response frame.
    pub fn answer(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() < 8 {
            return None;
        }
        let header = &request[..7];
        let pdu = &request[7..];
        let function = pdu[0];
        let address = u16::from_be_bytes([pdu[1], pdu[2]]) as usize;
        let mut response_pdu = vec![function];
        match function {
            FC_READ_COILS => {
                let count = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
                let nbytes = count.div_ceil(8);
                response_pdu.push(nbytes as u8);
                let mut bytes = vec![0u8; nbytes];
                for i in 0..count {
                    if self.coils.get(address + i).copied().unwrap_or(false) {
                        bytes[i / 8] |= 1 << (i % 8);
                    }
                }
                response_pdu.extend_from_slice(&bytes);
            }
            FC_READ_HOLDING_REGISTERS => {
                let count = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
                response_pdu.push((count * 2) as u8);
                for i in 0..count {
                    let value = self.registers.get(address + i).copied().unwrap_or(0);
                    response_pdu.extend_from_slice(&value.to_be_bytes());
                }
            }
            FC_WRITE_SINGLE_COIL => {
                let on = pdu[3] == 0xff;
                if let Some(coil) = self.coils.get_mut(address) {
                    *coil = on;
                }
                response_pdu = pdu.to_vec();
            }
            FC_WRITE_SINGLE_REGISTER => {
                let value = u16::from_be_bytes([pdu[3], pdu[4]]);
                if let Some(register) = self.registers.get_mut(address) {
                    *register = value;
                }
                response_pdu = pdu.to_vec();
            }
            _ => {
                response_pdu.push(0x01); // illegal function
                response_pdu[0] = function | 0x80;
            }
        }
        let mut response = Vec::with_capacity(7 + response_pdu.len());
        response.extend_from_slice(&header[..4]);
        response.extend_from_slice(&((response_pdu.len() as u16 + 1).to_be_bytes()));
        response.push(header[6]);
        response.extend_from_slice(&response_pdu);
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;

    fn client_with_image(image: ModbusServerImage) -> ModbusClient {
        let (transport, peer) = channel_pair();
        std::thread::spawn(move || {
            let mut image = image;
            while let Ok(request) = peer.outbound.recv() {
                if let Some(response) = image.answer(&request) {
                    if peer.inbound.send(response).is_err() {
                        break;
                    }
                }
            }
        });
        ModbusClient::new(Box::new(transport), 1, Duration::from_millis(500))
    }

    #[test]
    fn register_readback() {
        let mut image = ModbusServerImage::new(8, 8);
        image.registers[2] = 1234;
        image.registers[3] = 42;
        let mut client = client_with_image(image);
        assert_eq!(
            client.read_holding_registers(2, 2).unwrap(),
            vec![1234, 42]
        );
    }

    #[test]
    fn coil_write_and_readback() {
        let mut client = client_with_image(ModbusServerImage::new(8, 8));
        client.write_coil(3, true).unwrap();
        let coils = client.read_coils(0, 8).unwrap();
        assert!(coils[3]);
        assert!(!coils[0]);
    }

    #[test]
    fn write_register_roundtrip() {
        let mut client = client_with_image(ModbusServerImage::new(4, 4));
        client.write_register(1, 777).unwrap();
        assert_eq!(client.read_holding_registers(1, 1).unwrap(), vec![777]);
    }

    #[test]
    fn closed_peer_is_a_communication_error() {
        let (transport, peer) = channel_pair();
        drop(peer);
        let mut client =
            ModbusClient::new(Box::new(transport), 1, Duration::from_millis(50));
        assert!(matches!(
            client.read_holding_registers(0, 1),
            Err(DeviceError::Communication(_))
        ));
    }
}
