//! Reed–Solomon forward error correction over datagram shards. Every
//! outgoing datagram becomes a data shard tagged with a rolling sequence
//! number; after `k` of them, `m` parity shards follow. The decoder
//! regroups shards by sequence number and reconstructs a group as soon as
//! any `k` of its `k + m` shards have arrived, handing recovered data
//! shards back to the caller as if they had been received off the wire.

use log::{debug, trace};
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::core::timediff;
use crate::err::Error;
use crate::metrics::{Metrics, SNMP};

/// Shard header: `sn u32 LE | type u16 LE`.
pub(crate) const FEC_HEADER_SIZE: usize = 6;

/// Data shards carry a `u16 LE` body length right after the header so
/// reconstruction can strip the zero padding parity coding requires.
pub(crate) const FEC_HEADER_SIZE_PLUS2: usize = FEC_HEADER_SIZE + 2;

pub(crate) const TYPE_DATA: u16 = 0xf1;
pub(crate) const TYPE_PARITY: u16 = 0xf2;

/// A parsed shard: `body` is everything after the 6-byte header.
#[derive(Debug, Clone)]
pub(crate) struct Shard {
    pub sn: u32,
    pub kind: u16,
    pub body: Vec<u8>,
}

pub(crate) fn parse_shard(frame: &[u8]) -> Option<Shard> {
    if frame.len() <= FEC_HEADER_SIZE {
        return None;
    }
    let sn = u32::from_le_bytes(frame[0..4].try_into().unwrap());
    let kind = u16::from_le_bytes(frame[4..6].try_into().unwrap());
    if kind != TYPE_DATA && kind != TYPE_PARITY {
        return None;
    }
    Some(Shard {
        sn,
        kind,
        body: frame[FEC_HEADER_SIZE..].to_vec(),
    })
}

/// Extracts the payload a data shard carries (header and length stripped).
pub(crate) fn data_payload(body: &[u8]) -> Option<&[u8]> {
    if body.len() < 2 {
        return None;
    }
    let size = u16::from_le_bytes(body[0..2].try_into().unwrap()) as usize;
    if size < 2 || size > body.len() {
        return None;
    }
    Some(&body[2..size])
}

pub(crate) struct FecEncoder {
    data_shards: usize,
    parity_shards: usize,
    next_sn: u32,
    max_size: usize,
    group: Vec<Vec<u8>>,
    codec: Option<ReedSolomon>,
}

impl FecEncoder {
    /// `parity_shards == 0` keeps the shard framing (so both sides agree
    /// on the wire layout) but never emits parity.
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, Error> {
        if data_shards == 0 {
            return Err(Error::ConfigInvalid("fec requires at least one data shard"));
        }
        let codec = if parity_shards > 0 {
            Some(
                ReedSolomon::new(data_shards, parity_shards)
                    .map_err(|_| Error::ConfigInvalid("unusable fec shard counts"))?,
            )
        } else {
            None
        };
        Ok(FecEncoder {
            data_shards,
            parity_shards,
            next_sn: 0,
            max_size: 0,
            group: Vec::with_capacity(data_shards),
            codec,
        })
    }

    /// Overhead this encoder adds to every datagram.
    pub fn overhead(&self) -> usize {
        FEC_HEADER_SIZE_PLUS2
    }

    /// Wraps one datagram into a data shard and, when this completes a
    /// group, returns the parity shards to transmit after it.
    pub fn encode(&mut self, payload: &[u8]) -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut frame = Vec::with_capacity(FEC_HEADER_SIZE_PLUS2 + payload.len());
        frame.extend_from_slice(&self.next_sn.to_le_bytes());
        frame.extend_from_slice(&TYPE_DATA.to_le_bytes());
        frame.extend_from_slice(&((payload.len() + 2) as u16).to_le_bytes());
        frame.extend_from_slice(payload);
        self.next_sn = self.next_sn.wrapping_add(1);

        let Some(codec) = &self.codec else {
            return (frame, Vec::new());
        };

        // cache the shard body (length field included) for parity coding
        let body = frame[FEC_HEADER_SIZE..].to_vec();
        self.max_size = self.max_size.max(body.len());
        self.group.push(body);

        if self.group.len() < self.data_shards {
            return (frame, Vec::new());
        }

        let mut shards: Vec<Vec<u8>> = self
            .group
            .drain(..)
            .map(|mut body| {
                body.resize(self.max_size, 0);
                body
            })
            .collect();
        shards.resize(self.data_shards + self.parity_shards, vec![0u8; self.max_size]);

        // shard lengths are equal by construction, encode cannot fail
        codec.encode(&mut shards).expect("parity encode");

        let parity = shards
            .split_off(self.data_shards)
            .into_iter()
            .map(|body| {
                let mut frame = Vec::with_capacity(FEC_HEADER_SIZE + body.len());
                frame.extend_from_slice(&self.next_sn.to_le_bytes());
                frame.extend_from_slice(&TYPE_PARITY.to_le_bytes());
                frame.extend_from_slice(&body);
                self.next_sn = self.next_sn.wrapping_add(1);
                Metrics::incr(&SNMP.fec_parity_out);
                frame
            })
            .collect();

        self.max_size = 0;
        (frame, parity)
    }
}

pub(crate) struct FecDecoder {
    data_shards: usize,
    shard_size: usize,
    rx: Vec<Shard>,
    rx_limit: usize,
    codec: Option<ReedSolomon>,
}

impl FecDecoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, Error> {
        if data_shards == 0 {
            return Err(Error::ConfigInvalid("fec requires at least one data shard"));
        }
        let codec = if parity_shards > 0 {
            Some(
                ReedSolomon::new(data_shards, parity_shards)
                    .map_err(|_| Error::ConfigInvalid("unusable fec shard counts"))?,
            )
        } else {
            None
        };
        let shard_size = data_shards + parity_shards;
        Ok(FecDecoder {
            data_shards,
            shard_size,
            rx: Vec::new(),
            rx_limit: 3 * shard_size.max(1),
            codec,
        })
    }

    /// Ingests one shard. Returns the payloads of any data shards that
    /// reconstruction just recovered (never the shard passed in: its
    /// payload already went to the caller directly).
    pub fn decode(&mut self, shard: Shard) -> Vec<Vec<u8>> {
        Metrics::incr(&SNMP.fec_shards_in);

        // ordered insert by sn, newest towards the back; duplicates in
        // the lookback window are dropped
        let mut idx = self.rx.len();
        while idx > 0 {
            let d = timediff(shard.sn, self.rx[idx - 1].sn);
            if d == 0 {
                trace!("duplicate fec shard sn={}", shard.sn);
                return Vec::new();
            }
            if d > 0 {
                break;
            }
            idx -= 1;
        }
        let sn = shard.sn;
        self.rx.insert(idx, shard);

        let mut recovered = Vec::new();

        if let Some(codec) = &self.codec {
            let first = sn - sn % self.shard_size as u32;
            let group: Vec<usize> = (0..self.rx.len())
                .filter(|&i| {
                    let d = self.rx[i].sn.wrapping_sub(first);
                    (d as usize) < self.shard_size && timediff(self.rx[i].sn, first) >= 0
                })
                .collect();

            let data_present = group
                .iter()
                .filter(|&&i| (self.rx[i].sn.wrapping_sub(first) as usize) < self.data_shards)
                .count();

            if group.len() == self.shard_size
                || (group.len() >= self.data_shards && data_present == self.data_shards)
            {
                // nothing left to recover, release the group
                remove_group(&mut self.rx, &group);
            } else if group.len() >= self.data_shards {
                let max_size = group.iter().map(|&i| self.rx[i].body.len()).max().unwrap();
                let mut shards: Vec<Option<Vec<u8>>> = vec![None; self.shard_size];
                for &i in &group {
                    let pos = self.rx[i].sn.wrapping_sub(first) as usize;
                    let mut body = self.rx[i].body.clone();
                    body.resize(max_size, 0);
                    shards[pos] = Some(body);
                }

                match codec.reconstruct(&mut shards) {
                    Ok(()) => {
                        for (pos, shard) in shards.iter().enumerate().take(self.data_shards) {
                            let was_present = group
                                .iter()
                                .any(|&i| self.rx[i].sn.wrapping_sub(first) as usize == pos);
                            if was_present {
                                continue;
                            }
                            let body = shard.as_ref().unwrap();
                            match data_payload(body) {
                                Some(payload) => {
                                    Metrics::incr(&SNMP.fec_recovered);
                                    recovered.push(payload.to_vec());
                                }
                                None => {
                                    Metrics::incr(&SNMP.fec_unrecoverable);
                                    debug!("recovered shard has bad length field");
                                }
                            }
                        }
                        remove_group(&mut self.rx, &group);
                    }
                    Err(_) => {
                        Metrics::incr(&SNMP.fec_unrecoverable);
                    }
                }
            }
        }

        // bounded lookback: groups that never complete age out from the
        // front, the ARQ layer retransmits what they carried
        while self.rx.len() > self.rx_limit {
            self.rx.remove(0);
            Metrics::incr(&SNMP.fec_unrecoverable);
        }

        recovered
    }

}

// indices are ascending; remove from the back to keep them valid
fn remove_group(rx: &mut Vec<Shard>, indices: &[usize]) {
    for &i in indices.iter().rev() {
        rx.remove(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_with_losses(lost: &[usize]) {
        let (k, m) = (4, 2);
        let mut enc = FecEncoder::new(k, m).unwrap();
        let mut dec = FecDecoder::new(k, m).unwrap();

        let payloads: Vec<Vec<u8>> = (0..k)
            .map(|i| vec![i as u8 + 1; 10 + i * 7]) // uneven sizes
            .collect();

        let mut wire: Vec<Vec<u8>> = Vec::new();
        for p in &payloads {
            let (data, parity) = enc.encode(p);
            wire.push(data);
            wire.extend(parity);
        }
        assert_eq!(wire.len(), k + m);

        let mut seen: Vec<Vec<u8>> = Vec::new();
        for (i, frame) in wire.iter().enumerate() {
            if lost.contains(&i) {
                continue;
            }
            let shard = parse_shard(frame).unwrap();
            if shard.kind == TYPE_DATA {
                seen.push(data_payload(&shard.body).unwrap().to_vec());
            }
            seen.extend(dec.decode(shard));
        }

        let mut expected = payloads.clone();
        expected.sort();
        seen.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn no_loss_passthrough() {
        roundtrip_with_losses(&[]);
    }

    #[test]
    fn recovers_up_to_parity_losses() {
        roundtrip_with_losses(&[0]);
        roundtrip_with_losses(&[2]);
        roundtrip_with_losses(&[0, 3]);
        roundtrip_with_losses(&[1, 2]);
    }

    #[test]
    fn parity_loss_needs_no_recovery() {
        roundtrip_with_losses(&[4, 5]);
    }

    #[test]
    fn duplicate_shards_suppressed() {
        let mut enc = FecEncoder::new(2, 1).unwrap();
        let mut dec = FecDecoder::new(2, 1).unwrap();

        let (frame, _) = enc.encode(b"abc");
        let shard = parse_shard(&frame).unwrap();
        assert!(dec.decode(shard.clone()).is_empty());
        assert!(dec.decode(shard).is_empty());
        assert_eq!(dec.rx.len(), 1);
    }

    #[test]
    fn incomplete_groups_age_out() {
        let (k, m) = (3, 1);
        let mut enc = FecEncoder::new(k, m).unwrap();
        let mut dec = FecDecoder::new(k, m).unwrap();

        // feed only the first data shard of many groups; the lookback
        // ring stays bounded
        for round in 0..20 {
            let mut first = None;
            for i in 0..k {
                let (data, parity) = enc.encode(&[round as u8, i as u8]);
                if i == 0 {
                    first = Some(data);
                }
                drop(parity);
            }
            let shard = parse_shard(&first.unwrap()).unwrap();
            assert!(dec.decode(shard).is_empty());
        }
        assert!(dec.rx.len() <= dec.rx_limit);
    }

    #[test]
    fn framing_disabled_parity_still_passes_data() {
        // decoder with parity 0 never reconstructs but passes shards
        let mut enc = FecEncoder::new(10, 0).unwrap();
        let mut dec = FecDecoder::new(10, 0).unwrap();
        for i in 0..30u8 {
            let (data, parity) = enc.encode(&[i]);
            assert!(parity.is_empty());
            let shard = parse_shard(&data).unwrap();
            assert_eq!(data_payload(&shard.body).unwrap(), &[i]);
            assert!(dec.decode(shard).is_empty());
        }
    }

    #[test]
    fn mismatched_shard_counts_interoperate() {
        // a (10, 3) sender against a (10, 0) receiver: parity shards are
        // buffered and aged out, data still flows
        let mut enc = FecEncoder::new(10, 3).unwrap();
        let mut dec = FecDecoder::new(10, 0).unwrap();
        let mut delivered = 0;
        for i in 0..40u8 {
            let (data, parity) = enc.encode(&[i; 5]);
            let shard = parse_shard(&data).unwrap();
            assert_eq!(data_payload(&shard.body).unwrap(), &[i; 5]);
            delivered += 1;
            dec.decode(shard);
            for p in parity {
                dec.decode(parse_shard(&p).unwrap());
            }
        }
        assert_eq!(delivered, 40);
    }
}
