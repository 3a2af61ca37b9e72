use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;
use tokio::sync::mpsc;

use super::definition::{CommandConfig, CommandDefinition, ValidationResult};
use super::rules;
use super::{CatalogError, CatalogEvent, ParamMap, Result};

const AXIS_PARAM: &str = "axis";

/// Parsed catalog with lookup by key and by category.
#[derive(Debug, Clone, Default)]
struct CatalogIndex {
    config: Option<CommandConfig>,
    by_key: HashMap<String, usize>,
    /// Category names in first-seen order
    categories: Vec<String>,
}

impl CatalogIndex {
    fn build(config: CommandConfig) -> Result<Self> {
        let mut by_key = HashMap::with_capacity(config.commands.len());
        let mut categories: Vec<String> = Vec::new();

        for (index, command) in config.commands.iter().enumerate() {
            if command.key.trim().is_empty() {
                return Err(CatalogError::Load(format!("command #{} has an empty key", index)));
            }
            if by_key.insert(command.key.clone(), index).is_some() {
                return Err(CatalogError::Load(format!("duplicate command key '{}'", command.key)));
            }
            if !categories.iter().any(|c| c == &command.category) {
                categories.push(command.category.clone());
            }
        }

        Ok(Self { config: Some(config), by_key, categories })
    }

    fn commands(&self) -> &[CommandDefinition] {
        self.config.as_ref().map(|c| c.commands.as_slice()).unwrap_or(&[])
    }
}

/// Validates and expands catalog commands.
///
/// Constructed explicitly and loaded once; afterwards it is read-only and can
/// be shared behind an `Arc`.
#[derive(Debug, Default)]
pub struct CommandInterpreter {
    index: CatalogIndex,
    events_tx: Option<mpsc::UnboundedSender<CatalogEvent>>,
}

impl CommandInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpreter reporting load outcomes on the returned channel.
    pub fn with_events() -> (Self, mpsc::UnboundedReceiver<CatalogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { index: CatalogIndex::default(), events_tx: Some(tx) }, rx)
    }

    pub fn load_from_file(&mut self, path: &Path) -> Result<()> {
        let loaded = std::fs::read_to_string(path)
            .map_err(CatalogError::from)
            .and_then(|content| serde_json::from_str::<CommandConfig>(&content).map_err(CatalogError::from));
        match loaded {
            Ok(config) => {
                self.load_from_config(config)?;
                log::info!("Loaded command catalog from {}", path.display());
                Ok(())
            }
            Err(e) => Err(self.load_failed(e)),
        }
    }

    pub fn load_from_str(&mut self, content: &str) -> Result<()> {
        match serde_json::from_str::<CommandConfig>(content) {
            Ok(config) => self.load_from_config(config),
            Err(e) => Err(self.load_failed(e.into())),
        }
    }

    /// Replace the catalog. On failure the previously loaded catalog stays.
    pub fn load_from_config(&mut self, config: CommandConfig) -> Result<()> {
        match CatalogIndex::build(config) {
            Ok(index) => {
                self.index = index;
                let command_count = self.index.by_key.len();
                let category_count = self.index.categories.len();
                log::info!("Command catalog ready: {} commands in {} categories", command_count, category_count);
                self.emit(CatalogEvent::Loaded { command_count, category_count });
                Ok(())
            }
            Err(e) => Err(self.load_failed(e)),
        }
    }

    fn load_failed(&self, error: CatalogError) -> CatalogError {
        log::error!("Command catalog not loaded: {}", error);
        self.emit(CatalogEvent::Error(error.to_string()));
        error
    }

    fn emit(&self, event: CatalogEvent) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(event);
        }
    }

    pub fn get(&self, key: &str) -> Option<&CommandDefinition> {
        let index = *self.index.by_key.get(key)?;
        self.index.commands().get(index)
    }

    /// All commands in file order
    pub fn commands(&self) -> &[CommandDefinition] {
        self.index.commands()
    }

    pub fn categories(&self) -> &[String] {
        &self.index.categories
    }

    pub fn commands_in_category(&self, category: &str) -> Vec<&CommandDefinition> {
        self.commands().iter().filter(|c| c.category == category).collect()
    }

    /// Case-insensitive match on key, name or description
    pub fn search(&self, query: &str) -> Vec<&CommandDefinition> {
        let query = query.to_lowercase();
        self.commands()
            .iter()
            .filter(|c| {
                c.key.to_lowercase().contains(&query)
                    || c.name.to_lowercase().contains(&query)
                    || c.description.to_lowercase().contains(&query)
            })
            .collect()
    }

    pub fn config(&self) -> Option<&CommandConfig> {
        self.index.config.as_ref()
    }

    pub fn validate(&self, key: &str, params: &ParamMap) -> ValidationResult {
        let Some(command) = self.get(key) else {
            return ValidationResult::from_findings(vec![format!("Command '{}' does not exist", key)], Vec::new());
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        for param in &command.params {
            let Some(value) = present(params, &param.name) else {
                if param.required {
                    errors.push(format!("Parameter '{}' is required", param.name));
                }
                continue;
            };

            if !param.options.is_empty() {
                let text = stringify(value);
                if !param.options.iter().any(|o| o.value == text) {
                    let allowed: Vec<&str> = param.options.iter().map(|o| o.value.as_str()).collect();
                    errors.push(format!(
                        "Parameter '{}' value '{}' is invalid, expected one of: {}",
                        param.name,
                        text,
                        allowed.join(", ")
                    ));
                }
            }

            if matches!(param.default, Some(Value::Number(_))) && param.name.contains("current") {
                if let Some(number) = as_number(value) {
                    if number < 0.0 {
                        warnings.push(format!("Parameter '{}' is negative, check that this is intended", param.name));
                    }
                }
            }
        }

        ValidationResult::from_findings(errors, warnings)
    }

    /// Schema validation plus the value rules: numeric parameters must hold
    /// numbers, and out-of-range or suspicious values and combinations are
    /// reported. Used by callers that want advice before dispatching;
    /// [`expand`](Self::expand) only enforces the schema.
    pub fn validate_detailed(&self, key: &str, params: &ParamMap) -> ValidationResult {
        let Some(command) = self.get(key) else {
            return self.validate(key, params);
        };
        let ValidationResult { mut errors, mut warnings, .. } = self.validate(key, params);

        for param in &command.params {
            if let Some(value) = present(params, &param.name) {
                rules::check_value(param, value, &mut errors, &mut warnings);
            }
        }
        rules::check_combinations(params, &mut warnings);

        ValidationResult::from_findings(errors, warnings)
    }

    /// Typical values for one parameter of `key`
    pub fn suggestions(&self, key: &str, param_name: &str) -> Vec<f64> {
        self.get(key)
            .and_then(|command| command.params.iter().find(|p| p.name == param_name))
            .map(rules::suggested_values)
            .unwrap_or_default()
    }

    /// Validate, then render the command line for `key`.
    ///
    /// Declared defaults fill missing parameters. Named placeholders are
    /// substituted first; `axis{axis}` and `{axis}` then both become
    /// `axis<N>`. A placeholder left over after that is an error, so a
    /// partially rendered line is never returned.
    pub fn expand(&self, key: &str, params: &ParamMap) -> Result<String> {
        let command = self.get(key).ok_or_else(|| CatalogError::UnknownKey(key.to_string()))?;

        let validation = self.validate(key, params);
        if !validation.valid {
            return Err(CatalogError::ValidationFailed(validation.errors));
        }
        for warning in &validation.warnings {
            log::warn!("{}: {}", key, warning);
        }

        let mut values = params.clone();
        for param in &command.params {
            if present(&values, &param.name).is_none() {
                if let Some(default) = &param.default {
                    values.insert(param.name.clone(), default.clone());
                }
            }
        }

        let mut line = command.template.clone();
        for (name, value) in &values {
            if name == AXIS_PARAM || is_absent(value) {
                continue;
            }
            line = line.replace(&format!("{{{}}}", name), &stringify(value));
        }

        if let Some(axis) = present(&values, AXIS_PARAM) {
            let axis = format!("axis{}", stringify(axis));
            line = line.replace("axis{axis}", &axis).replace("{axis}", &axis);
        }

        if let Some(placeholder) = find_placeholder(&line) {
            return Err(CatalogError::UnresolvedPlaceholder { key: key.to_string(), placeholder });
        }
        Ok(line)
    }

    /// Declared defaults only; parameters without a default are omitted.
    pub fn defaults_for(&self, key: &str) -> ParamMap {
        let mut defaults = ParamMap::new();
        if let Some(command) = self.get(key) {
            for param in &command.params {
                if let Some(default) = &param.default {
                    defaults.insert(param.name.clone(), default.clone());
                }
            }
        }
        defaults
    }
}

/// Null and empty strings count as not supplied.
fn is_absent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn present<'a>(params: &'a ParamMap, name: &str) -> Option<&'a Value> {
    params.get(name).filter(|v| !is_absent(v))
}

/// Text form used for option checks and substitution; whole-number floats
/// render without a fraction so `1.0` selects axis `1`.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) if n.is_f64() => n.as_f64().map(rules::format_number).unwrap_or_else(|| n.to_string()),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| !n.is_nan()),
        _ => None,
    }
}

/// First `{identifier}` left in `line`
fn find_placeholder(line: &str) -> Option<String> {
    let mut rest = line;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else { return None };
        let inner = &after[..close];
        if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Some(inner.to_string());
        }
        rest = after;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const CATALOG: &str = r#"{
        "version": "1.0",
        "transport": "serial",
        "newline": "\n",
        "commands": [
            {
                "key": "set_state",
                "name": "Set axis state",
                "description": "Request an axis state",
                "category": "control",
                "template": "w axis{axis}.requested_state {state}",
                "params": [
                    { "name": "axis", "required": false, "default": 0, "options": [
                        { "value": "0", "label": "Axis 0" }, { "value": "1", "label": "Axis 1" }
                    ] },
                    { "name": "state", "required": true }
                ]
            },
            {
                "key": "current_limit",
                "name": "Current limit",
                "description": "Motor current limit",
                "category": "motor",
                "template": "w {axis}.motor.config.current_lim {current_lim}",
                "params": [
                    { "name": "axis", "required": true },
                    { "name": "current_lim", "required": false, "default": 10.0 }
                ]
            },
            {
                "key": "reboot",
                "name": "Reboot",
                "description": "Restart the controller",
                "category": "system",
                "template": "sr"
            },
            {
                "key": "broken",
                "name": "Broken",
                "category": "system",
                "template": "w {target} {value}",
                "params": [ { "name": "value", "required": true } ]
            }
        ]
    }"#;

    fn loaded() -> CommandInterpreter {
        let mut interpreter = CommandInterpreter::new();
        interpreter.load_from_str(CATALOG).unwrap();
        interpreter
    }

    fn params(value: Value) -> ParamMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn index_keeps_file_order() {
        let interpreter = loaded();
        let keys: Vec<&str> = interpreter.commands().iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["set_state", "current_limit", "reboot", "broken"]);
        assert_eq!(interpreter.categories(), &["control", "motor", "system"]);
        assert_eq!(interpreter.commands_in_category("system").len(), 2);
        assert_eq!(interpreter.search("CURRENT").len(), 1);
        assert_eq!(interpreter.config().map(|c| c.version.as_str()), Some("1.0"));
    }

    #[test]
    fn missing_required_parameter_is_one_error() {
        let interpreter = loaded();
        let result = interpreter.validate("set_state", &ParamMap::new());
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("state"));

        let empty = interpreter.validate("set_state", &params(json!({ "state": "" })));
        assert_eq!(empty.errors.len(), 1);
    }

    #[test]
    fn option_values_are_compared_as_strings() {
        let interpreter = loaded();
        assert!(interpreter.validate("set_state", &params(json!({ "axis": 1, "state": 8 }))).valid);
        let result = interpreter.validate("set_state", &params(json!({ "axis": 2, "state": 8 })));
        assert!(!result.valid);
        assert!(result.errors[0].contains("'2'"));
    }

    #[test]
    fn negative_current_only_warns() {
        let interpreter = loaded();
        let result = interpreter.validate("current_limit", &params(json!({ "axis": 0, "current_lim": -3 })));
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn unknown_key() {
        let interpreter = loaded();
        assert!(!interpreter.validate("nope", &ParamMap::new()).valid);
        assert!(matches!(interpreter.expand("nope", &ParamMap::new()), Err(CatalogError::UnknownKey(_))));
    }

    #[test]
    fn expand_fills_defaults_and_axis() {
        let interpreter = loaded();
        assert_eq!(
            interpreter.expand("set_state", &params(json!({ "state": 8 }))).unwrap(),
            "w axis0.requested_state 8"
        );
        assert_eq!(
            interpreter.expand("current_limit", &params(json!({ "axis": 1 }))).unwrap(),
            "w axis1.motor.config.current_lim 10"
        );
        assert_eq!(interpreter.expand("reboot", &ParamMap::new()).unwrap(), "sr");
    }

    #[test]
    fn whole_number_floats_render_as_integers() {
        let interpreter = loaded();
        let supplied = params(json!({ "axis": 1.0, "state": 8.0 }));
        assert!(interpreter.validate("set_state", &supplied).valid, "1.0 should select option '1'");
        assert_eq!(interpreter.expand("set_state", &supplied).unwrap(), "w axis1.requested_state 8");
        assert_eq!(
            interpreter.expand("current_limit", &params(json!({ "axis": 0, "current_lim": 12.5 }))).unwrap(),
            "w axis0.motor.config.current_lim 12.5"
        );
    }

    #[test]
    fn detailed_validation_adds_value_rules() {
        let interpreter = loaded();

        let result = interpreter.validate_detailed("current_limit", &params(json!({ "axis": 0, "current_lim": "lots" })));
        assert!(!result.valid);
        assert_eq!(result.errors, vec!["Parameter 'current_lim' must be a number".to_string()]);

        let result = interpreter.validate_detailed("current_limit", &params(json!({ "axis": 0, "current_lim": 75 })));
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("75A"), "{}", result.warnings[0]);

        let result = interpreter.validate_detailed("set_state", &params(json!({ "state": 12 })));
        assert!(!result.valid);
        assert!(result.errors[0].contains("Invalid requested state 12"), "{:?}", result.errors);

        // schema findings come first and are kept
        let result = interpreter.validate_detailed("set_state", &ParamMap::new());
        assert_eq!(result.errors, vec!["Parameter 'state' is required".to_string()]);
        assert!(!interpreter.validate_detailed("nope", &ParamMap::new()).valid);

        // the basic check leaves value rules out
        assert!(interpreter.validate("set_state", &params(json!({ "state": 12 }))).valid);
    }

    #[test]
    fn suggestions_come_from_the_parameter() {
        let interpreter = loaded();
        assert_eq!(interpreter.suggestions("current_limit", "current_lim"), vec![1.0, 5.0, 10.0, 20.0]);
        assert!(interpreter.suggestions("current_limit", "missing").is_empty());
        assert!(interpreter.suggestions("nope", "axis").is_empty());
    }

    #[test]
    fn expand_never_returns_partial_lines() {
        let interpreter = loaded();
        assert!(matches!(
            interpreter.expand("set_state", &ParamMap::new()),
            Err(CatalogError::ValidationFailed(errors)) if errors.len() == 1
        ));
        match interpreter.expand("broken", &params(json!({ "value": 3 }))) {
            Err(CatalogError::UnresolvedPlaceholder { placeholder, .. }) => assert_eq!(placeholder, "target"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn defaults_only_lists_declared_defaults() {
        let interpreter = loaded();
        assert_eq!(interpreter.defaults_for("set_state"), params(json!({ "axis": 0 })));
        assert!(interpreter.defaults_for("reboot").is_empty());
        assert!(interpreter.defaults_for("nope").is_empty());
    }

    #[test]
    fn failed_load_keeps_previous_catalog() {
        let (mut interpreter, mut events) = CommandInterpreter::with_events();
        interpreter.load_from_str(CATALOG).unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            CatalogEvent::Loaded { command_count: 4, category_count: 3 }
        );

        assert!(matches!(interpreter.load_from_str("{ \"version\": "), Err(CatalogError::Json(_))));
        let duplicate = r#"{ "version": "2", "commands": [
            { "key": "a", "name": "A", "category": "x", "template": "a" },
            { "key": "a", "name": "A again", "category": "x", "template": "a" }
        ] }"#;
        assert!(matches!(interpreter.load_from_str(duplicate), Err(CatalogError::Load(_))));

        assert!(matches!(events.try_recv().unwrap(), CatalogEvent::Error(_)));
        assert!(matches!(events.try_recv().unwrap(), CatalogEvent::Error(_)));
        assert_eq!(interpreter.commands().len(), 4);
        assert!(interpreter.get("set_state").is_some());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut interpreter = CommandInterpreter::new();
        assert!(matches!(
            interpreter.load_from_file(&dir.path().join("missing.json")),
            Err(CatalogError::Io(_))
        ));
    }

    #[test]
    fn placeholder_scan_ignores_non_identifiers() {
        assert_eq!(find_placeholder("w a {b}"), Some("b".to_string()));
        assert_eq!(find_placeholder("w a {} { x }"), None);
        assert_eq!(find_placeholder("w {a b} {ok_1}"), Some("ok_1".to_string()));
    }
}
