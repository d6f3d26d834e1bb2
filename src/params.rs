/*!
# Epidemiological parameters

[`ParameterVector`] holds the eight scalar model parameters of one dataset.
[`FieldSet`] is a small set of [`ParamField`]s; it is used both as the
sharing mask of a joint run and as the set of parameters that are estimated
rather than held fixed.

[`JointParameters`] is the parameter store of a joint run: fields in the
sharing mask live once in a shared vector, every other field lives in the
dataset's own vector. The effective parameters of a dataset are obtained
with [`JointParameters::view`], so datasets can never disagree on a shared
field.

```rust
use transtree_mcmc::params::{FieldSet, JointParameters, ParamField, ParameterVector};

let share = FieldSet::parse(["pi"]).unwrap();
let mut joint = JointParameters::new(share, &[ParameterVector::default(); 2]);
joint.set_shared(ParamField::Pi, 0.3);
assert_eq!(joint.view(0).pi, joint.view(1).pi);
```
*/

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Names of the model parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamField {
    /// Within-host effective population size times generation time.
    Neg,
    /// Size parameter of the negative-binomial offspring distribution.
    OffR,
    /// Probability parameter of the negative-binomial offspring distribution.
    OffP,
    /// Sampling proportion.
    Pi,
    /// Shape of the Gamma generation-time distribution.
    WShape,
    /// Scale of the Gamma generation-time distribution.
    WScale,
    /// Shape of the Gamma sampling-time distribution.
    WsShape,
    /// Scale of the Gamma sampling-time distribution.
    WsScale,
}

impl ParamField {
    /// All fields in canonical order. Parameter moves visit fields in this order.
    pub const ALL: [ParamField; 8] = [
        ParamField::Neg,
        ParamField::OffR,
        ParamField::OffP,
        ParamField::Pi,
        ParamField::WShape,
        ParamField::WScale,
        ParamField::WsShape,
        ParamField::WsScale,
    ];

    /// Canonical name, e.g. `"off.r"`.
    pub fn name(self) -> &'static str {
        match self {
            ParamField::Neg => "neg",
            ParamField::OffR => "off.r",
            ParamField::OffP => "off.p",
            ParamField::Pi => "pi",
            ParamField::WShape => "w.shape",
            ParamField::WScale => "w.scale",
            ParamField::WsShape => "ws.shape",
            ParamField::WsScale => "ws.scale",
        }
    }

    /// Whether the sampler can estimate this field. Interval distributions are fixed inputs.
    pub fn is_estimable(self) -> bool {
        matches!(
            self,
            ParamField::Neg | ParamField::OffR | ParamField::OffP | ParamField::Pi
        )
    }

    /// Whether the field only enters the genealogical part of the likelihood.
    pub fn is_genealogical(self) -> bool {
        self == ParamField::Neg
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for ParamField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for ParamField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ParamField::ALL
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| Error::UnknownField(s.to_string()))
    }
}

/// A set of parameter fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FieldSet(u8);

impl FieldSet {
    /// The empty set: nothing shared / nothing estimated.
    pub fn empty() -> Self {
        FieldSet(0)
    }

    /// Every field.
    pub fn all() -> Self {
        ParamField::ALL.into_iter().collect()
    }

    /// Every estimable field.
    pub fn estimable() -> Self {
        ParamField::ALL
            .into_iter()
            .filter(|f| f.is_estimable())
            .collect()
    }

    /// Parses canonical field names.
    pub fn parse<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|n| n.as_ref().parse::<ParamField>())
            .collect()
    }

    /// Adds a field, builder style.
    pub fn with(mut self, field: ParamField) -> Self {
        self.insert(field);
        self
    }

    pub fn insert(&mut self, field: ParamField) {
        self.0 |= field.bit();
    }

    pub fn remove(&mut self, field: ParamField) {
        self.0 &= !field.bit();
    }

    pub fn contains(&self, field: ParamField) -> bool {
        self.0 & field.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn intersection(&self, other: &FieldSet) -> FieldSet {
        FieldSet(self.0 & other.0)
    }

    pub fn difference(&self, other: &FieldSet) -> FieldSet {
        FieldSet(self.0 & !other.0)
    }

    /// Members in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = ParamField> {
        let set = *self;
        ParamField::ALL.into_iter().filter(move |f| set.contains(*f))
    }
}

impl FromIterator<ParamField> for FieldSet {
    fn from_iter<T: IntoIterator<Item = ParamField>>(iter: T) -> Self {
        let mut set = FieldSet::empty();
        for f in iter {
            set.insert(f);
        }
        set
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|p| p.name()).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// The sharing mask of a joint run.
pub type SharingMask = FieldSet;

/// Epidemiological parameters of one dataset.
///
/// Times are in the unit of the phylogeny dates (years in the defaults).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterVector {
    /// Within-host effective population size times generation time.
    pub neg: f64,
    /// Negative-binomial size of the offspring distribution.
    pub off_r: f64,
    /// Negative-binomial probability of the offspring distribution.
    pub off_p: f64,
    /// Sampling proportion.
    pub pi: f64,
    pub w_shape: f64,
    pub w_scale: f64,
    pub ws_shape: f64,
    pub ws_scale: f64,
}

impl Default for ParameterVector {
    fn default() -> Self {
        Self {
            neg: 100.0 / 365.0,
            off_r: 1.0,
            off_p: 0.5,
            pi: 0.5,
            w_shape: 2.0,
            w_scale: 1.0,
            ws_shape: 2.0,
            ws_scale: 1.0,
        }
    }
}

impl ParameterVector {
    /// Reads a field.
    pub fn get(&self, field: ParamField) -> f64 {
        match field {
            ParamField::Neg => self.neg,
            ParamField::OffR => self.off_r,
            ParamField::OffP => self.off_p,
            ParamField::Pi => self.pi,
            ParamField::WShape => self.w_shape,
            ParamField::WScale => self.w_scale,
            ParamField::WsShape => self.ws_shape,
            ParamField::WsScale => self.ws_scale,
        }
    }

    /// Writes a field.
    pub fn set(&mut self, field: ParamField, value: f64) {
        let slot = match field {
            ParamField::Neg => &mut self.neg,
            ParamField::OffR => &mut self.off_r,
            ParamField::OffP => &mut self.off_p,
            ParamField::Pi => &mut self.pi,
            ParamField::WShape => &mut self.w_shape,
            ParamField::WScale => &mut self.w_scale,
            ParamField::WsShape => &mut self.ws_shape,
            ParamField::WsScale => &mut self.ws_scale,
        };
        *slot = value;
    }

    /// Returns a copy with `field` set to `value`.
    pub fn with(mut self, field: ParamField, value: f64) -> Self {
        self.set(field, value);
        self
    }

    /// Whether `value` lies in the support of `field`.
    pub fn in_support(field: ParamField, value: f64) -> bool {
        match field {
            ParamField::OffP | ParamField::Pi => value > 0.0 && value < 1.0,
            _ => value.is_finite() && value > 0.0,
        }
    }

    /// Checks every field against its support.
    pub fn validate(&self) -> Result<()> {
        for field in ParamField::ALL {
            let value = self.get(field);
            if !Self::in_support(field, value) {
                return Err(Error::InvalidParameters { field, value });
            }
        }
        Ok(())
    }

    /// Mean of the offspring distribution, `off.r * off.p / (1 - off.p)`.
    pub fn reproduction_number(&self) -> f64 {
        self.off_r * self.off_p / (1.0 - self.off_p)
    }

    /// Mean generation interval.
    pub fn mean_generation_time(&self) -> f64 {
        self.w_shape * self.w_scale
    }

    /// Values in canonical field order.
    pub fn to_array(&self) -> [f64; 8] {
        ParamField::ALL.map(|f| self.get(f))
    }

    /// True if the fields that drive the epidemiological term are identical.
    pub fn same_epidemiology(&self, other: &ParameterVector) -> bool {
        ParamField::ALL
            .into_iter()
            .filter(|f| !f.is_genealogical())
            .all(|f| self.get(f).to_bits() == other.get(f).to_bits())
    }
}

/// Parameter store of a joint run.
#[derive(Debug, Clone, PartialEq)]
pub struct JointParameters {
    mask: SharingMask,
    shared: ParameterVector,
    local: Vec<ParameterVector>,
}

impl JointParameters {
    /// Builds the store; shared fields take their value from the first dataset.
    pub fn new(mask: SharingMask, starts: &[ParameterVector]) -> Self {
        let shared = starts.first().copied().unwrap_or_default();
        Self {
            mask,
            shared,
            local: starts.to_vec(),
        }
    }

    /// The sharing mask.
    pub fn mask(&self) -> SharingMask {
        self.mask
    }

    /// Number of datasets.
    pub fn n_datasets(&self) -> usize {
        self.local.len()
    }

    /// Effective parameters of `dataset`.
    pub fn view(&self, dataset: usize) -> ParameterVector {
        let mut params = self.local[dataset];
        for field in self.mask.iter() {
            params.set(field, self.shared.get(field));
        }
        params
    }

    /// Value of a shared field.
    pub fn shared(&self, field: ParamField) -> f64 {
        self.shared.get(field)
    }

    /// Writes a shared field; every dataset sees the new value.
    pub fn set_shared(&mut self, field: ParamField, value: f64) {
        debug_assert!(self.mask.contains(field));
        self.shared.set(field, value);
    }

    /// Writes a non-shared field of one dataset.
    pub fn set_local(&mut self, dataset: usize, field: ParamField, value: f64) {
        debug_assert!(!self.mask.contains(field));
        self.local[dataset].set(field, value);
    }

    /// One handle per dataset that can change only that dataset's non-shared fields.
    pub fn datasets_mut(&mut self) -> Vec<DatasetParams<'_>> {
        let mask = self.mask;
        let shared = &self.shared;
        self.local
            .iter_mut()
            .map(|local| DatasetParams {
                mask,
                shared,
                local,
            })
            .collect()
    }
}

/// A dataset's view of a [`JointParameters`] store during its sweep.
#[derive(Debug)]
pub struct DatasetParams<'a> {
    mask: SharingMask,
    shared: &'a ParameterVector,
    local: &'a mut ParameterVector,
}

impl DatasetParams<'_> {
    /// Effective parameters of the dataset.
    pub fn effective(&self) -> ParameterVector {
        let mut params = *self.local;
        for field in self.mask.iter() {
            params.set(field, self.shared.get(field));
        }
        params
    }

    pub fn mask(&self) -> SharingMask {
        self.mask
    }

    /// Writes a non-shared field.
    pub fn set_local(&mut self, field: ParamField, value: f64) {
        debug_assert!(!self.mask.contains(field));
        self.local.set(field, value);
    }
}
