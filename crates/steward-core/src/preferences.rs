use serde_json::json;

use steward_state::{LoadOptions, SaveOptions, StateStore};
use steward_types::UserPreferences;

use crate::orchestrator::RunError;

pub const PREFERENCES_STATE: &str = "user_preferences";
const PREFERENCES_VERSION: u32 = 1;

fn preferences_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "required": ["voting_strategy", "confidence_threshold", "max_proposals_per_run"],
        "properties": {
            "voting_strategy": {
                "type": "string",
                "enum": ["conservative", "balanced", "aggressive"]
            },
            "confidence_threshold": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "max_proposals_per_run": { "type": "integer", "minimum": 1, "maximum": 10 },
            "allow_list": { "type": "array", "items": { "type": "string" } },
            "deny_list": { "type": "array", "items": { "type": "string" } }
        }
    })
}

/// Loads the operator's voting policy, falling back to a backup and then
/// to defaults when the document never existed. Unrecoverable corruption
/// or an invalid payload is fatal for the run.
pub async fn load_preferences(state: &StateStore) -> Result<UserPreferences, RunError> {
    let loaded = state
        .load(
            PREFERENCES_STATE,
            LoadOptions {
                schema: Some(preferences_schema()),
                target_version: Some(PREFERENCES_VERSION),
                allow_recovery: true,
                ..Default::default()
            },
        )
        .await
        .map_err(|err| RunError::Preferences(err.to_string()))?;

    let Some(raw) = loaded else {
        return Ok(UserPreferences::default());
    };
    let prefs: UserPreferences =
        serde_json::from_value(raw).map_err(|err| RunError::Preferences(err.to_string()))?;
    prefs
        .validate()
        .map_err(|err| RunError::Preferences(err.to_string()))?;
    Ok(prefs)
}

pub async fn save_preferences(
    state: &StateStore,
    prefs: &UserPreferences,
) -> Result<(), RunError> {
    prefs
        .validate()
        .map_err(|err| RunError::Preferences(err.to_string()))?;
    let payload =
        serde_json::to_value(prefs).map_err(|err| RunError::Preferences(err.to_string()))?;
    state
        .save(
            PREFERENCES_STATE,
            &payload,
            SaveOptions {
                schema: Some(preferences_schema()),
                version: PREFERENCES_VERSION,
                ..Default::default()
            },
        )
        .await
        .map_err(RunError::State)?;
    Ok(())
}
