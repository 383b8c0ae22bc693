//! Preset registries: pure lookup tables mapping entry-strategy and
//! exit-preset identifiers to the parameter bundles the state machine runs.

pub mod entry;
pub mod exit;

pub use entry::{
    resolve_entry_preset, EntryPreset, EntryPresetKey, ResolvedEntryPreset,
};
pub use exit::{
    resolve_exit_preset_config, AtrExitParams, ExitParams, ExitPreset, PercentExitParams,
};
