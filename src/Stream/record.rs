//! Fixed 128-byte event records.
//!
//! One record is 16 little-endian `f64` values: four four-vectors
//! `(E, px, py, pz)` in the particle order π+, π−, γ1, γ2.

/// Values per record.
pub const RECORD_FIELDS: usize = 16;

/// Bytes per record.
pub const RECORD_SIZE: usize = RECORD_FIELDS * std::mem::size_of::<f64>();

/// Charged pion mass in GeV/c².
pub const PION_MASS: f64 = 0.139;

/// Photon mass.
pub const PHOTON_MASS: f64 = 0.0;

/// Particle labels in record order.
pub const PARTICLE_NAMES: [&str; 4] = ["π+", "π-", "γ1", "γ2"];

/// Energy and three-momentum of one particle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FourVector {
    pub e: f64,
    pub px: f64,
    pub py: f64,
    pub pz: f64,
}

impl FourVector {
    pub const fn new(e: f64, px: f64, py: f64, pz: f64) -> Self {
        Self { e, px, py, pz }
    }

    /// Build from a momentum magnitude, polar angle `theta`, azimuth `phi` and a mass.
    pub fn from_spherical(mag: f64, theta: f64, phi: f64, mass: f64) -> Self {
        let (sin_t, cos_t) = theta.sin_cos();
        let (sin_p, cos_p) = phi.sin_cos();
        let px = mag * sin_t * cos_p;
        let py = mag * sin_t * sin_p;
        let pz = mag * cos_t;
        let e = (mag * mag + mass * mass).sqrt();
        Self { e, px, py, pz }
    }

    /// |p|
    pub fn momentum(&self) -> f64 {
        (self.px * self.px + self.py * self.py + self.pz * self.pz).sqrt()
    }

    /// Invariant mass, clamped at zero for slightly space-like rounding.
    pub fn mass(&self) -> f64 {
        let p = self.momentum();
        (self.e * self.e - p * p).max(0.0).sqrt()
    }

    fn fields(&self) -> [f64; 4] {
        [self.e, self.px, self.py, self.pz]
    }
}

/// One reconstructed event: two charged pions and two photons.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhysicsEvent {
    pub pi_plus: FourVector,
    pub pi_minus: FourVector,
    pub gamma1: FourVector,
    pub gamma2: FourVector,
}

impl PhysicsEvent {
    /// Particles in record order.
    pub fn particles(&self) -> [&FourVector; 4] {
        [&self.pi_plus, &self.pi_minus, &self.gamma1, &self.gamma2]
    }

    /// The 16 record values in wire order.
    pub fn to_fields(&self) -> [f64; RECORD_FIELDS] {
        let mut out = [0.0; RECORD_FIELDS];
        for (chunk, p) in out.chunks_exact_mut(4).zip(self.particles()) {
            chunk.copy_from_slice(&p.fields());
        }
        out
    }

    pub fn from_fields(v: &[f64; RECORD_FIELDS]) -> Self {
        let fv = |i: usize| FourVector::new(v[i], v[i + 1], v[i + 2], v[i + 3]);
        Self {
            pi_plus: fv(0),
            pi_minus: fv(4),
            gamma1: fv(8),
            gamma2: fv(12),
        }
    }
}

/// Serialize `event` into exactly [`RECORD_SIZE`] bytes of `dest`.
pub fn serialize_event(event: &PhysicsEvent, dest: &mut [u8; RECORD_SIZE]) {
    for (out, value) in dest.chunks_exact_mut(8).zip(event.to_fields()) {
        out.copy_from_slice(&value.to_le_bytes());
    }
}

/// Owned-array convenience over [`serialize_event`].
pub fn encode_event(event: &PhysicsEvent) -> [u8; RECORD_SIZE] {
    let mut out = [0u8; RECORD_SIZE];
    serialize_event(event, &mut out);
    out
}

/// Read one record back. `None` when fewer than [`RECORD_SIZE`] bytes are given;
/// trailing bytes beyond the first record are ignored.
pub fn deserialize_event(bytes: &[u8]) -> Option<PhysicsEvent> {
    let record = bytes.get(..RECORD_SIZE)?;
    let mut fields = [0.0; RECORD_FIELDS];
    for (value, raw) in fields.iter_mut().zip(record.chunks_exact(8)) {
        let mut le = [0u8; 8];
        le.copy_from_slice(raw);
        *value = f64::from_le_bytes(le);
    }
    Some(PhysicsEvent::from_fields(&fields))
}

/// Iterate over the whole records of a payload. A trailing partial record is skipped.
pub fn records(payload: &[u8]) -> impl Iterator<Item = PhysicsEvent> + '_ {
    payload
        .chunks_exact(RECORD_SIZE)
        .filter_map(deserialize_event)
}
