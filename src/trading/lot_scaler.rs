//! Lot scaling: converts a master volume into a broker-valid slave volume.

use rust_decimal::Decimal;

use crate::models::VolumeConstraints;

/// Why a scaled volume cannot be traded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Untradeable {
    /// The broker gave us no volume rules for the symbol
    NoConstraints,
    /// Still below the global minimum lot after rounding and clamping
    BelowMinimum,
}

/// Result of scaling one master volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaledVolume {
    Tradeable(Decimal),
    Untradeable(Untradeable),
}

impl ScaledVolume {
    #[cfg(test)]
    pub fn volume(&self) -> Option<Decimal> {
        match self {
            ScaledVolume::Tradeable(v) => Some(*v),
            ScaledVolume::Untradeable(_) => None,
        }
    }
}

/// Scales master lots for a slave.
#[derive(Debug, Clone)]
pub struct LotScaler {
    min_lot: Decimal,
}

impl LotScaler {
    pub fn new(min_lot: Decimal) -> Self {
        Self { min_lot }
    }

    /// Scale `master_volume` by `scale_factor` for a symbol.
    ///
    /// Rounds down to the volume step so a slave never carries more than its
    /// proportional share, then clamps up to the symbol minimum (brokers
    /// refuse anything smaller).
    pub fn scale(
        &self,
        constraints: Option<&VolumeConstraints>,
        master_volume: Decimal,
        scale_factor: Decimal,
    ) -> ScaledVolume {
        let Some(c) = constraints else {
            return ScaledVolume::Untradeable(Untradeable::NoConstraints);
        };
        if c.step <= Decimal::ZERO {
            return ScaledVolume::Untradeable(Untradeable::NoConstraints);
        }

        let raw = master_volume * scale_factor;
        let stepped = (raw / c.step).floor() * c.step;
        let volume = stepped.max(c.min_volume).normalize();

        if volume < self.min_lot || volume <= Decimal::ZERO {
            return ScaledVolume::Untradeable(Untradeable::BelowMinimum);
        }

        ScaledVolume::Tradeable(volume)
    }
}

/// Slave-to-master sizing ratio.
///
/// `None` when the slave holds less than the master: slaves are never
/// leveraged beyond 1:1 against the master, so such a slave sits the trade out.
pub fn scale_factor(slave_balance: Decimal, master_balance: Decimal) -> Option<Decimal> {
    if master_balance <= Decimal::ZERO || slave_balance < master_balance {
        return None;
    }
    Some(slave_balance / master_balance)
}
