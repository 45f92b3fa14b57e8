//! Typed configuration blocks for the three engines.
//!
//! Every field participates in a canonical byte encoding; the HMAC-SHA256
//! digest of the three encodings plus the topology is exchanged inside the
//! signed DH handshake, so daemons refuse to pair unless their configurations
//! are bit-identical.

use crate::constants::HMAC_LEN;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

/// Link-engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    pub crypto: bool,
    pub encrypt: bool,
    pub ordered_delivery: bool,
    pub reintroduce_messages: bool,
    pub tcp_fairness: bool,
    pub session_blocking: bool,
    /// Incoming messages between standalone acks.
    pub msg_per_saa: u32,
    /// Retransmissions allowed per flow-control burst.
    pub send_batch_size: u32,
    pub intrusion_tolerance_mode: bool,
    /// Reliable timeout, in round-trip times.
    pub reliable_timeout_factor: u32,
    /// Gap between NACK re-requests, in round-trip times.
    pub nack_timeout_factor: u32,
    pub ack_timeout: Duration,
    pub ping_timeout: Duration,
    pub dh_timeout: Duration,
    pub incarnation_timeout: Duration,
    pub min_rtt_ms: u32,
    pub default_rtt_ms: u32,
    /// Round-trip fraction before the first NACK for a gap.
    pub init_nack_factor: f64,
    pub loss_threshold: f64,
    pub loss_calc_decay: f64,
    pub loss_calc_time_trigger: Duration,
    pub loss_calc_pkt_trigger: u32,
    pub loss_penalty: u32,
    pub ping_threshold: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            crypto: true,
            encrypt: true,
            ordered_delivery: true,
            reintroduce_messages: false,
            tcp_fairness: true,
            session_blocking: false,
            msg_per_saa: 10,
            send_batch_size: 15,
            intrusion_tolerance_mode: true,
            reliable_timeout_factor: 10,
            nack_timeout_factor: 2,
            ack_timeout: Duration::from_millis(10),
            ping_timeout: Duration::from_millis(200),
            dh_timeout: Duration::from_micros(999_999),
            incarnation_timeout: Duration::from_micros(999_999),
            min_rtt_ms: 2,
            default_rtt_ms: 10,
            init_nack_factor: 0.25,
            loss_threshold: 0.02,
            loss_calc_decay: 0.8,
            loss_calc_time_trigger: Duration::from_secs(10),
            loss_calc_pkt_trigger: 1000,
            loss_penalty: 10_000,
            ping_threshold: 10,
        }
    }
}

/// Priority-flood configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PrioConfig {
    pub crypto: bool,
    pub default_priority: u8,
    /// Per-neighbor cap on stored packets before hog eviction.
    pub max_mess_stored: u32,
    /// Initial capacity reserved in each origin's belly.
    pub min_belly_size: u32,
    pub default_expire: Duration,
    pub garbage_collection: Duration,
}

impl Default for PrioConfig {
    fn default() -> Self {
        PrioConfig {
            crypto: true,
            default_priority: 1,
            max_mess_stored: 500,
            min_belly_size: 1024,
            default_expire: Duration::from_secs(600),
            garbage_collection: Duration::from_secs(60),
        }
    }
}

/// Reliable-flood configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RelConfig {
    pub crypto: bool,
    pub hbh_ack_timeout: Duration,
    pub e2e_ack_timeout: Duration,
    pub status_change_timeout: Duration,
    /// State changes between standalone acks.
    pub saa_threshold: u32,
    pub hbh_advance: bool,
    pub hbh_opt: bool,
    pub e2e_opt: bool,
}

impl Default for RelConfig {
    fn default() -> Self {
        RelConfig {
            crypto: true,
            hbh_ack_timeout: Duration::from_millis(100),
            e2e_ack_timeout: Duration::from_millis(150),
            status_change_timeout: Duration::from_millis(150),
            saa_threshold: 10,
            hbh_advance: false,
            hbh_opt: true,
            e2e_opt: true,
        }
    }
}

fn put_bool(out: &mut Vec<u8>, v: bool) {
    out.push(v as u8);
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_duration(out: &mut Vec<u8>, v: Duration) {
    put_u64(out, v.as_micros() as u64);
}

fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_be_bytes());
}

impl LinkConfig {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        put_bool(&mut out, self.crypto);
        put_bool(&mut out, self.encrypt);
        put_bool(&mut out, self.ordered_delivery);
        put_bool(&mut out, self.reintroduce_messages);
        put_bool(&mut out, self.tcp_fairness);
        put_bool(&mut out, self.session_blocking);
        put_u32(&mut out, self.msg_per_saa);
        put_u32(&mut out, self.send_batch_size);
        put_bool(&mut out, self.intrusion_tolerance_mode);
        put_u32(&mut out, self.reliable_timeout_factor);
        put_u32(&mut out, self.nack_timeout_factor);
        put_duration(&mut out, self.ack_timeout);
        put_duration(&mut out, self.ping_timeout);
        put_duration(&mut out, self.dh_timeout);
        put_duration(&mut out, self.incarnation_timeout);
        put_u32(&mut out, self.min_rtt_ms);
        put_u32(&mut out, self.default_rtt_ms);
        put_f64(&mut out, self.init_nack_factor);
        put_f64(&mut out, self.loss_threshold);
        put_f64(&mut out, self.loss_calc_decay);
        put_duration(&mut out, self.loss_calc_time_trigger);
        put_u32(&mut out, self.loss_calc_pkt_trigger);
        put_u32(&mut out, self.loss_penalty);
        put_u64(&mut out, self.ping_threshold);
        out
    }
}

impl PrioConfig {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        put_bool(&mut out, self.crypto);
        out.push(self.default_priority);
        put_u32(&mut out, self.max_mess_stored);
        put_u32(&mut out, self.min_belly_size);
        put_duration(&mut out, self.default_expire);
        put_duration(&mut out, self.garbage_collection);
        out
    }
}

impl RelConfig {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        put_bool(&mut out, self.crypto);
        put_duration(&mut out, self.hbh_ack_timeout);
        put_duration(&mut out, self.e2e_ack_timeout);
        put_duration(&mut out, self.status_change_timeout);
        put_u32(&mut out, self.saa_threshold);
        put_bool(&mut out, self.hbh_advance);
        put_bool(&mut out, self.hbh_opt);
        put_bool(&mut out, self.e2e_opt);
        out
    }
}

/// Digest over the three configuration blocks and the topology description,
/// exchanged inside the signed DH handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigHash(pub [u8; HMAC_LEN]);

impl ConfigHash {
    pub fn compute(
        link: &LinkConfig,
        prio: &PrioConfig,
        rel: &RelConfig,
        topology: &[u8],
    ) -> Self {
        let mut mac = Hmac::<Sha256>::new_from_slice(b"trellis-config-v1")
            .expect("hmac accepts any key length");
        mac.update(&link.canonical_bytes());
        mac.update(&prio.canonical_bytes());
        mac.update(&rel.canonical_bytes());
        mac.update(topology);
        let out = mac.finalize().into_bytes();
        let mut hash = [0u8; HMAC_LEN];
        hash.copy_from_slice(&out);
        ConfigHash(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_sensitive_to_every_block() {
        let base = ConfigHash::compute(
            &LinkConfig::default(),
            &PrioConfig::default(),
            &RelConfig::default(),
            b"topo",
        );

        let mut link = LinkConfig::default();
        link.msg_per_saa += 1;
        assert_ne!(
            base,
            ConfigHash::compute(&link, &PrioConfig::default(), &RelConfig::default(), b"topo")
        );

        let mut rel = RelConfig::default();
        rel.hbh_advance = !rel.hbh_advance;
        assert_ne!(
            base,
            ConfigHash::compute(&LinkConfig::default(), &PrioConfig::default(), &rel, b"topo")
        );

        assert_ne!(
            base,
            ConfigHash::compute(
                &LinkConfig::default(),
                &PrioConfig::default(),
                &RelConfig::default(),
                b"other-topo"
            )
        );
    }
}
