//! Control vocabulary, per-camera descriptors and staged values.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CameraError, Result};

/// Universal control vocabulary shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControlId {
    /// Analogue gain.
    Gain,
    /// Exposure time in microseconds.
    Exposure,
    /// Gamma.
    Gamma,
    /// Red channel balance.
    RedBalance,
    /// Blue channel balance.
    BlueBalance,
    /// Brightness / black-level offset.
    Brightness,
    /// Mirror left-right (0 or 1).
    FlipHorizontal,
    /// Mirror top-bottom (0 or 1).
    FlipVertical,
    /// USB bandwidth limit.
    UsbTraffic,
    /// Binning factor.
    Binning,
    /// Region-of-interest support. Offered as a flag; use `set_roi`.
    Roi,
}

impl ControlId {
    /// Every control in the vocabulary.
    pub const ALL: [Self; 11] = [
        Self::Gain,
        Self::Exposure,
        Self::Gamma,
        Self::RedBalance,
        Self::BlueBalance,
        Self::Brightness,
        Self::FlipHorizontal,
        Self::FlipVertical,
        Self::UsbTraffic,
        Self::Binning,
        Self::Roi,
    ];

    /// Short lowercase name, as accepted on the command line.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gain => "gain",
            Self::Exposure => "exposure",
            Self::Gamma => "gamma",
            Self::RedBalance => "red-balance",
            Self::BlueBalance => "blue-balance",
            Self::Brightness => "brightness",
            Self::FlipHorizontal => "hflip",
            Self::FlipVertical => "vflip",
            Self::UsbTraffic => "usb-traffic",
            Self::Binning => "binning",
            Self::Roi => "roi",
        }
    }

    /// Look a control up by [`ControlId::name`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.name() == name)
    }

    /// Controls that change the buffer layout and are never deferred.
    pub const fn is_geometry(self) -> bool {
        matches!(self, Self::Binning | Self::Roi)
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static description of one tunable, fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlDescriptor {
    /// Which control.
    pub id: ControlId,
    /// Smallest accepted value.
    pub min: i64,
    /// Largest accepted value.
    pub max: i64,
    /// Granularity.
    pub step: i64,
    /// Power-on default.
    pub default: i64,
    /// Whether the device can drive this control automatically.
    pub auto_capable: bool,
}

impl ControlDescriptor {
    /// Manual-only control.
    pub const fn new(id: ControlId, min: i64, max: i64, step: i64, default: i64) -> Self {
        Self {
            id,
            min,
            max,
            step,
            default,
            auto_capable: false,
        }
    }

    /// Mark the control as auto-capable.
    #[must_use]
    pub const fn with_auto(mut self) -> Self {
        self.auto_capable = true;
        self
    }

    /// Boolean on/off control.
    pub const fn toggle(id: ControlId) -> Self {
        Self::new(id, 0, 1, 1, 0)
    }

    /// Clamp a value into `[min, max]`.
    pub fn clamp(&self, value: i64) -> i64 {
        value.clamp(self.min, self.max.max(self.min))
    }

    /// Range as the `(min, max, step, default)` tuple consumers expect.
    pub const fn range(&self) -> (i64, i64, i64, i64) {
        (self.min, self.max, self.step, self.default)
    }
}

/// Current value of a control plus its auto/manual flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlValue {
    /// Numeric value.
    pub value: i64,
    /// Whether the device drives the control itself.
    pub auto: bool,
}

impl ControlValue {
    /// Manual value.
    pub const fn manual(value: i64) -> Self {
        Self { value, auto: false }
    }

    /// Value with an explicit auto flag.
    pub const fn new(value: i64, auto: bool) -> Self {
        Self { value, auto }
    }
}

/// The descriptors one open camera offers. Never mutated after open.
#[derive(Debug, Clone, Default)]
pub struct ControlRegistry {
    descriptors: BTreeMap<ControlId, ControlDescriptor>,
}

impl ControlRegistry {
    /// Build from a backend capability query. Later duplicates win.
    pub fn from_descriptors<I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = ControlDescriptor>,
    {
        Self {
            descriptors: descriptors.into_iter().map(|d| (d.id, d)).collect(),
        }
    }

    /// Whether the control is offered.
    pub fn has(&self, id: ControlId) -> bool {
        self.descriptors.contains_key(&id)
    }

    /// Descriptor for a control.
    pub fn get(&self, id: ControlId) -> Option<&ControlDescriptor> {
        self.descriptors.get(&id)
    }

    /// Iterate over the offered controls in vocabulary order.
    pub fn iter(&self) -> impl Iterator<Item = &ControlDescriptor> {
        self.descriptors.values()
    }

    /// Number of offered controls.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether nothing is offered.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Bring a requested value inside the descriptor's range.
    ///
    /// Hardware ranges drift across firmware revisions, so out-of-range
    /// values are clamped rather than rejected. Auto is dropped for controls
    /// that cannot run automatically.
    pub fn normalise(&self, id: ControlId, requested: ControlValue) -> Result<ControlValue> {
        let descriptor = self.get(id).ok_or(CameraError::UnsupportedControl(id))?;
        let value = descriptor.clamp(requested.value);
        if value != requested.value {
            log::warn!(
                "{id} value {} outside [{}, {}], clamped to {value}",
                requested.value,
                descriptor.min,
                descriptor.max
            );
        }
        let auto = if requested.auto && !descriptor.auto_capable {
            log::warn!("{id} has no automatic mode, using manual");
            false
        } else {
            requested.auto
        };
        Ok(ControlValue { value, auto })
    }
}

#[derive(Debug, Clone, Copy)]
struct ControlSlot {
    applied: ControlValue,
    staged: Option<ControlValue>,
}

/// Live control values shared between the caller and the capture thread.
///
/// `applied` is what the backend last accepted; `staged` is a pending change
/// (the slot is dirty while it is `Some`).
#[derive(Debug, Clone, Default)]
pub struct ControlTable {
    slots: BTreeMap<ControlId, ControlSlot>,
}

impl ControlTable {
    /// Seed the table with values read back at open.
    pub fn with_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = (ControlId, ControlValue)>,
    {
        Self {
            slots: values
                .into_iter()
                .map(|(id, applied)| {
                    (
                        id,
                        ControlSlot {
                            applied,
                            staged: None,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Stage a value; overwrites any earlier staged value for the same id.
    pub fn stage(&mut self, id: ControlId, value: ControlValue) {
        self.slots
            .entry(id)
            .and_modify(|slot| slot.staged = Some(value))
            .or_insert(ControlSlot {
                applied: value,
                staged: Some(value),
            });
    }

    /// Remove and return every dirty control, in vocabulary order.
    pub fn take_dirty(&mut self) -> Vec<(ControlId, ControlValue)> {
        self.slots
            .iter_mut()
            .filter_map(|(id, slot)| slot.staged.take().map(|value| (*id, value)))
            .collect()
    }

    /// Put back a value the backend could not take yet. A newer staged value
    /// for the same id wins.
    pub fn restage(&mut self, id: ControlId, value: ControlValue) {
        if !self.is_dirty(id) {
            self.stage(id, value);
        }
    }

    /// Record a value the backend accepted.
    pub fn record_applied(&mut self, id: ControlId, value: ControlValue) {
        self.slots
            .entry(id)
            .and_modify(|slot| slot.applied = value)
            .or_insert(ControlSlot {
                applied: value,
                staged: None,
            });
    }

    /// Last applied value.
    pub fn applied(&self, id: ControlId) -> Option<ControlValue> {
        self.slots.get(&id).map(|slot| slot.applied)
    }

    /// Whether a change is waiting for the next flush.
    pub fn is_dirty(&self, id: ControlId) -> bool {
        self.slots.get(&id).is_some_and(|slot| slot.staged.is_some())
    }

    /// Number of dirty controls.
    pub fn dirty_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.staged.is_some()).count()
    }
}
