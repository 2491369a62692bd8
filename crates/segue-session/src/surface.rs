//! Generated control surfaces bound to a unit's parameter endpoints.

use crate::snapshot::ParamSnapshot;
use segue_core::{AtomicFloat, ParamSpec, ProcessingUnit};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("duplicate control id '{0}'")]
    DuplicateControl(String),

    #[error("control '{id}' has an invalid range {min}..{max}")]
    InvalidRange { id: String, min: f32, max: f32 },

    #[error("unit exposes no endpoint for control '{0}'")]
    MissingEndpoint(String),
}

/// One user-facing control: a spec plus the unit's lock-free endpoint.
pub struct Control {
    spec: ParamSpec,
    endpoint: Arc<AtomicFloat>,
}

impl Control {
    pub fn spec(&self) -> &ParamSpec {
        &self.spec
    }

    pub fn value(&self) -> f32 {
        self.endpoint.get()
    }

    pub(crate) fn endpoint(&self) -> Arc<AtomicFloat> {
        self.endpoint.clone()
    }
}

/// The generated controls for one window, built against one unit.
///
/// Construction is the Binding step of the update protocol: it walks the
/// unit's parameter specs and resolves every endpoint up front, so a broken
/// surface is detected before the unit goes anywhere near the audio thread.
#[derive(Default)]
pub struct ControlSurfaceSet {
    controls: Vec<Control>,
}

impl ControlSurfaceSet {
    /// Empty surface (no-DSP state).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build(unit: &dyn ProcessingUnit) -> Result<Self, SurfaceError> {
        let specs = unit.param_specs();
        let mut controls: Vec<Control> = Vec::with_capacity(specs.len());

        for spec in specs {
            if spec.min >= spec.max {
                return Err(SurfaceError::InvalidRange {
                    id: spec.id,
                    min: spec.min,
                    max: spec.max,
                });
            }
            if controls.iter().any(|control| control.spec.id == spec.id) {
                return Err(SurfaceError::DuplicateControl(spec.id));
            }
            let endpoint = unit
                .param_endpoint(&spec.id)
                .ok_or_else(|| SurfaceError::MissingEndpoint(spec.id.clone()))?;
            controls.push(Control { spec, endpoint });
        }

        Ok(Self { controls })
    }

    pub fn controls(&self) -> &[Control] {
        &self.controls
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }

    /// Set a control, clamped to its range. Returns false for unknown ids.
    pub fn set(&self, id: &str, value: f32) -> bool {
        match self.controls.iter().find(|control| control.spec.id == id) {
            Some(control) => {
                let clamped = value.clamp(control.spec.min, control.spec.max);
                control.endpoint.set(clamped);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<f32> {
        self.controls
            .iter()
            .find(|control| control.spec.id == id)
            .map(|control| control.endpoint.get())
    }

    /// Current values of every control.
    pub fn snapshot(&self) -> ParamSnapshot {
        let mut snapshot = ParamSnapshot::default();
        for control in &self.controls {
            snapshot
                .values
                .insert(control.spec.id.clone(), control.endpoint.get());
        }
        snapshot
    }

    /// Restore saved values. Ids the current unit no longer exposes are
    /// ignored - the program may have changed shape since the save.
    pub fn apply(&self, snapshot: &ParamSnapshot) {
        for (id, value) in &snapshot.values {
            self.set(id, *value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use segue_core::{SilenceUnit, SineUnit};

    #[test]
    fn test_build_from_unit() {
        let unit = SineUnit::new(440.0, 48_000.0);
        let surface = ControlSurfaceSet::build(&unit).unwrap();
        assert_eq!(surface.len(), 2);
        assert_abs_diff_eq!(surface.get("osc/freq").unwrap(), 440.0);
    }

    #[test]
    fn test_empty_surface_for_unit_without_params() {
        let surface = ControlSurfaceSet::build(&SilenceUnit).unwrap();
        assert!(surface.is_empty());
    }

    #[test]
    fn test_set_clamps_and_reaches_unit() {
        let unit = SineUnit::new(440.0, 48_000.0);
        let endpoint = unit.param_endpoint("osc/freq").unwrap();
        let surface = ControlSurfaceSet::build(&unit).unwrap();

        assert!(surface.set("osc/freq", 880.0));
        assert_abs_diff_eq!(endpoint.get(), 880.0);

        surface.set("osc/freq", 1_000_000.0);
        assert_abs_diff_eq!(endpoint.get(), 20_000.0);

        assert!(!surface.set("nope", 1.0));
    }

    #[test]
    fn test_snapshot_roundtrip_ignores_unknown() {
        let unit = SineUnit::new(440.0, 48_000.0);
        let surface = ControlSurfaceSet::build(&unit).unwrap();
        surface.set("osc/freq", 660.0);

        let mut snapshot = surface.snapshot();
        snapshot.values.insert("gone/param".into(), 0.3);

        let other_unit = SineUnit::new(440.0, 48_000.0);
        let other = ControlSurfaceSet::build(&other_unit).unwrap();
        other.apply(&snapshot);
        assert_abs_diff_eq!(other.get("osc/freq").unwrap(), 660.0);
    }

    #[test]
    fn test_invalid_specs_rejected() {
        struct BadUnit {
            flipped: bool,
        }
        impl ProcessingUnit for BadUnit {
            fn inputs(&self) -> usize {
                0
            }
            fn outputs(&self) -> usize {
                2
            }
            fn process(&mut self, _: usize, _: &[Vec<f32>], _: &mut [Vec<f32>]) {}
            fn param_specs(&self) -> Vec<ParamSpec> {
                if self.flipped {
                    vec![ParamSpec::new("a", "A", 1.0, 0.0, 0.5)]
                } else {
                    vec![
                        ParamSpec::new("a", "A", 0.0, 1.0, 0.5),
                        ParamSpec::new("a", "A", 0.0, 1.0, 0.5),
                    ]
                }
            }
            fn param_endpoint(&self, _: &str) -> Option<Arc<AtomicFloat>> {
                Some(Arc::new(AtomicFloat::new(0.5)))
            }
        }

        assert!(matches!(
            ControlSurfaceSet::build(&BadUnit { flipped: false }),
            Err(SurfaceError::DuplicateControl(_))
        ));
        assert!(matches!(
            ControlSurfaceSet::build(&BadUnit { flipped: true }),
            Err(SurfaceError::InvalidRange { .. })
        ));
    }
}
