//! Declarative rule files
//!
//! A rule file is TOML. Each `[[rules]]` entry binds one event key to either a
//! plain action list or an ordered set of `[[rules.when]]` branches, which may
//! nest. Names are resolved against a [`Vocabulary`]; `@name` refers to an
//! entry of the file's `[groups]` table and `sleep:<duration>` defers the rest
//! of the list. Conditions may also filter state changes directly with
//! `old:<state>[,<state>...]` and `new:<state>[,<state>...]`.
//!
//! A match cancels the deferred work the file's rules still have pending,
//! unless the rule sets `restart = false`. `[[states]]` entries declare a
//! state machine whose states with actions become further rules. A file may
//! also name a native script to instantiate.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use homescript_events::parse_duration;
use serde::Deserialize;
use tracing::debug;

use super::{ScriptLoader, ScriptSource, Vocabulary};
use crate::action::{Action, RawActions};
use crate::condition::Condition;
use crate::context::ScriptContext;
use crate::error::{panic_message, HostError, LoadError, SchemaError};
use crate::schema::{RawBranch, RawConditionSchema, RawEventSchema, TriggerMode, MAX_SCHEMA_DEPTH};
use crate::script::{Script, ScriptRegistry};
use crate::state_machine::{State, StateId, StateMachine, StateTrigger};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    script: Option<String>,
    #[serde(default)]
    settings: toml::Table,
    #[serde(default)]
    groups: BTreeMap<String, Vec<toml::Value>>,
    #[serde(default)]
    rules: Vec<RuleSpec>,
    #[serde(default)]
    states: Vec<StateSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleSpec {
    event: String,
    actions: Option<Vec<toml::Value>>,
    #[serde(default)]
    first_match: bool,
    #[serde(default = "default_restart")]
    restart: bool,
    #[serde(default)]
    when: Vec<BranchSpec>,
}

fn default_restart() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BranchSpec {
    condition: String,
    actions: Option<Vec<toml::Value>>,
    #[serde(default)]
    when: Vec<BranchSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StateSpec {
    name: String,
    condition: String,
    actions: Option<Vec<toml::Value>>,
    #[serde(default)]
    activated_by: Vec<TriggerSpec>,
    #[serde(default)]
    affect_by: Vec<TriggerSpec>,
    /// Groups of state names; `!name` is the inverted state
    #[serde(default)]
    depend_on: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TriggerSpec {
    entity: String,
    #[serde(default)]
    from: Vec<String>,
    #[serde(default)]
    to: Vec<String>,
    condition: Option<String>,
}

/// A rule file after name resolution, not yet built or registered
#[derive(Debug)]
pub struct ParsedRuleFile {
    pub script: Option<String>,
    pub settings: toml::Table,
    pub schema: RawEventSchema,
}

/// Loads `.toml` rule files
#[derive(Clone, Default)]
pub struct TomlScriptLoader {
    vocabulary: Vocabulary,
    scripts: ScriptRegistry,
}

impl TomlScriptLoader {
    pub fn new(vocabulary: Vocabulary) -> Self {
        Self {
            vocabulary,
            scripts: ScriptRegistry::new(),
        }
    }

    /// Native scripts that files may name with `script = "..."`
    pub fn with_scripts(mut self, scripts: ScriptRegistry) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Parse and resolve a rule file without touching the host
    pub fn parse(&self, source: &ScriptSource) -> Result<ParsedRuleFile, LoadError> {
        let file: RuleFile = toml::from_str(&source.contents).map_err(|e| LoadError::Parse {
            path: source.path.clone(),
            message: e.message().to_string(),
        })?;

        let schema_error = |source_error: SchemaError| LoadError::Schema {
            script: source.id.clone(),
            source: source_error,
        };

        let resolver = Resolver {
            vocabulary: &self.vocabulary,
            groups: &file.groups,
        };

        // Every group must resolve, even if no rule uses it
        for name in file.groups.keys() {
            resolver
                .group(name, &mut Vec::new(), 0)
                .map_err(schema_error)?;
        }

        let mut schema = RawEventSchema::new();
        for rule in &file.rules {
            let condition_schema = resolver.rule(rule).map_err(schema_error)?;
            let mode = if rule.restart {
                TriggerMode::Restart
            } else {
                TriggerMode::Parallel
            };
            schema.insert_with_mode(rule.event.clone(), condition_schema, mode);
        }

        if !file.states.is_empty() {
            let machine = resolver.machine(&file.states).map_err(schema_error)?;
            schema.extend(machine.build().map_err(schema_error)?);
        }

        Ok(ParsedRuleFile {
            script: file.script,
            settings: file.settings,
            schema,
        })
    }

    fn instantiate(
        &self,
        source: &ScriptSource,
        factory: &str,
        ctx: &mut ScriptContext,
    ) -> Result<Box<dyn Script>, LoadError> {
        let mut script = self
            .scripts
            .create(factory)
            .ok_or_else(|| LoadError::UnknownScript {
                script: source.id.clone(),
                factory: factory.to_string(),
            })?;

        let loaded = catch_unwind(AssertUnwindSafe(|| script.on_load(ctx)));
        match loaded {
            Ok(Ok(())) => Ok(script),
            Ok(Err(e)) => Err(LoadError::Script {
                script: source.id.clone(),
                message: format!("{:#}", e),
            }),
            Err(payload) => Err(LoadError::Panicked {
                script: source.id.clone(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl ScriptLoader for TomlScriptLoader {
    fn name(&self) -> &str {
        "toml"
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some("toml")
    }

    fn load(
        &self,
        source: &ScriptSource,
        ctx: &mut ScriptContext,
    ) -> Result<Option<Box<dyn Script>>, LoadError> {
        let parsed = self.parse(source)?;
        ctx.extend_settings(parsed.settings);

        if !parsed.schema.is_empty() {
            let bound = ctx
                .add_event_schema(parsed.schema)
                .map_err(|e| match e {
                    HostError::Schema(source_error) => LoadError::Schema {
                        script: source.id.clone(),
                        source: source_error,
                    },
                    other => LoadError::Host {
                        script: source.id.clone(),
                        source: other,
                    },
                })?;
            debug!(target: "scripting", "Script '{}' bound {} event(s)", source.id, bound);
        }

        match parsed.script {
            Some(factory) => self.instantiate(source, &factory, ctx).map(Some),
            None => Ok(None),
        }
    }
}

struct Resolver<'a> {
    vocabulary: &'a Vocabulary,
    groups: &'a BTreeMap<String, Vec<toml::Value>>,
}

impl Resolver<'_> {
    fn rule(&self, rule: &RuleSpec) -> Result<RawConditionSchema, SchemaError> {
        // The actions would become an always-true first branch
        if rule.first_match && rule.actions.is_some() && !rule.when.is_empty() {
            return Err(SchemaError::Invalid(format!(
                "rule for '{}' combines first_match with top-level actions",
                rule.event
            )));
        }

        let mut schema = match (&rule.actions, rule.when.is_empty()) {
            (Some(actions), _) => {
                RawConditionSchema::unconditional(self.actions(actions, &mut Vec::new(), 0)?)
            }
            (None, false) => RawConditionSchema::conditions(),
            (None, true) => {
                return Err(SchemaError::Invalid(format!(
                    "rule for '{}' has neither actions nor branches",
                    rule.event
                )))
            }
        };

        for branch in &rule.when {
            let condition = self.condition(&branch.condition)?;
            schema = match self.branch(branch, 1)? {
                RawBranch::Actions(actions) => schema.when(condition, actions),
                RawBranch::Nested(branches) => schema.when_nested(
                    condition,
                    RawConditionSchema::Conditional {
                        branches,
                        exclusive: false,
                    },
                ),
            };
        }

        if rule.first_match {
            schema = schema.first_match();
        }
        Ok(schema)
    }

    fn branch(&self, branch: &BranchSpec, depth: usize) -> Result<RawBranch, SchemaError> {
        if depth > MAX_SCHEMA_DEPTH {
            return Err(SchemaError::TooDeep {
                limit: MAX_SCHEMA_DEPTH,
            });
        }
        match (&branch.actions, branch.when.is_empty()) {
            (Some(actions), true) => Ok(RawBranch::Actions(self.actions(
                actions,
                &mut Vec::new(),
                0,
            )?)),
            (None, false) => {
                let mut nested = Vec::with_capacity(branch.when.len());
                for inner in &branch.when {
                    nested.push((self.condition(&inner.condition)?, self.branch(inner, depth + 1)?));
                }
                Ok(RawBranch::Nested(nested))
            }
            (Some(_), false) => Err(SchemaError::Invalid(format!(
                "branch '{}' has both actions and nested branches",
                branch.condition
            ))),
            (None, true) => Err(SchemaError::Invalid(format!(
                "branch '{}' has neither actions nor nested branches",
                branch.condition
            ))),
        }
    }

    /// `a | b & !c`: `|` binds loosest, then `&`, then prefix `!`
    fn condition(&self, expression: &str) -> Result<Condition, SchemaError> {
        let mut alternatives = Vec::new();
        for alternative in expression.split('|') {
            let mut terms = Vec::new();
            for term in alternative.split('&') {
                terms.push(self.term(term.trim(), expression)?);
            }
            alternatives.push(Condition::all(terms));
        }
        if alternatives.len() == 1 {
            return Ok(alternatives.remove(0));
        }
        Ok(Condition::any(alternatives))
    }

    fn term(&self, term: &str, expression: &str) -> Result<Condition, SchemaError> {
        if let Some(negated) = term.strip_prefix('!') {
            return Ok(!self.term(negated.trim_start(), expression)?);
        }
        if term.is_empty() {
            return Err(SchemaError::Invalid(format!(
                "malformed condition expression '{}'",
                expression
            )));
        }
        if let Some(states) = term.strip_prefix("old:") {
            return Ok(Condition::old_state_in(state_list(states, expression)?));
        }
        if let Some(states) = term.strip_prefix("new:") {
            return Ok(Condition::new_state_in(state_list(states, expression)?));
        }
        self.vocabulary.condition(term)
    }

    fn machine(&self, specs: &[StateSpec]) -> Result<StateMachine, SchemaError> {
        let mut machine = StateMachine::new();
        let mut ids = Vec::with_capacity(specs.len());

        for spec in specs {
            let mut state = State::new(spec.name.clone(), self.condition(&spec.condition)?);
            if let Some(actions) = &spec.actions {
                state = state.side_effects(self.actions(actions, &mut Vec::new(), 0)?.normalize()?);
            }
            for trigger in &spec.activated_by {
                state = state.activated_by(self.trigger(trigger)?);
            }
            for trigger in &spec.affect_by {
                state = state.affect_by(self.trigger(trigger)?);
            }
            ids.push(machine.add(state)?);
        }

        // Dependencies may name states declared further down
        for (spec, id) in specs.iter().zip(ids) {
            for group in &spec.depend_on {
                let mut members = Vec::with_capacity(group.len());
                for name in group {
                    members.push(state_ref(&mut machine, name)?);
                }
                machine.add_dependency(id, members)?;
            }
        }
        Ok(machine)
    }

    fn trigger(&self, spec: &TriggerSpec) -> Result<StateTrigger, SchemaError> {
        let mut trigger = StateTrigger::on(spec.entity.clone());
        if !spec.from.is_empty() {
            trigger = trigger.from(spec.from.iter().cloned());
        }
        if !spec.to.is_empty() {
            trigger = trigger.to(spec.to.iter().cloned());
        }
        if let Some(condition) = &spec.condition {
            trigger = trigger.when(self.condition(condition)?);
        }
        Ok(trigger)
    }

    fn actions(
        &self,
        values: &[toml::Value],
        in_progress: &mut Vec<String>,
        depth: usize,
    ) -> Result<RawActions, SchemaError> {
        if depth > MAX_SCHEMA_DEPTH {
            return Err(SchemaError::TooDeep {
                limit: MAX_SCHEMA_DEPTH,
            });
        }

        let mut items = Vec::with_capacity(values.len());
        for (index, value) in values.iter().enumerate() {
            match value {
                toml::Value::String(name) => {
                    if let Some(delay) = name.strip_prefix("sleep:") {
                        let delay = parse_duration(delay).ok_or_else(|| {
                            SchemaError::Invalid(format!("invalid delay in '{}'", name))
                        })?;
                        let rest = self
                            .actions(&values[index + 1..], in_progress, depth + 1)?
                            .normalize_at(depth + 1)?;
                        items.push(RawActions::One(Action::after(delay, rest)));
                        break;
                    }
                    items.push(self.action(name, in_progress, depth)?);
                }
                toml::Value::Array(nested) => {
                    items.push(self.actions(nested, in_progress, depth + 1)?);
                }
                other => {
                    return Err(SchemaError::Invalid(format!(
                        "expected an action name or list, found {}",
                        other.type_str()
                    )))
                }
            }
        }
        Ok(RawActions::Many(items))
    }

    fn action(
        &self,
        name: &str,
        in_progress: &mut Vec<String>,
        depth: usize,
    ) -> Result<RawActions, SchemaError> {
        match name.strip_prefix('@') {
            Some(group) => self.group(group, in_progress, depth),
            None => Ok(RawActions::One(self.vocabulary.action(name)?)),
        }
    }

    fn group(
        &self,
        name: &str,
        in_progress: &mut Vec<String>,
        depth: usize,
    ) -> Result<RawActions, SchemaError> {
        if in_progress.iter().any(|g| g == name) {
            return Err(SchemaError::Cycle(name.to_string()));
        }
        let members = self.groups.get(name).ok_or_else(|| SchemaError::UnknownName {
            what: "group",
            name: name.to_string(),
        })?;

        in_progress.push(name.to_string());
        let resolved = self.actions(members, in_progress, depth + 1);
        in_progress.pop();

        let list = resolved?.normalize_at(depth + 1)?;
        Ok(RawActions::One(Action::group(format!("@{}", name), list)))
    }
}

fn state_list(states: &str, expression: &str) -> Result<Vec<String>, SchemaError> {
    let states: Vec<String> = states.split(',').map(|s| s.trim().to_string()).collect();
    if states.iter().any(String::is_empty) {
        return Err(SchemaError::Invalid(format!(
            "empty state name in '{}'",
            expression
        )));
    }
    Ok(states)
}

fn state_ref(machine: &mut StateMachine, name: &str) -> Result<StateId, SchemaError> {
    let (inverted, name) = match name.strip_prefix('!') {
        Some(rest) => (true, rest.trim()),
        None => (false, name.trim()),
    };
    let id = machine.find(name).ok_or_else(|| SchemaError::UnknownName {
        what: "state",
        name: name.to_string(),
    })?;
    if inverted {
        machine.invert(id)
    } else {
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{build_event_schema, ConditionSchema};
    use homescript_events::{EventKind, EventPayload};
    use std::path::PathBuf;

    fn vocabulary() -> Vocabulary {
        Vocabulary::new()
            .with_condition(Condition::nullary("is_night", || true))
            .with_condition(Condition::nullary("is_day", || false))
            .with_condition(Condition::nullary("away", || false))
            .with_action(Action::nullary("light.on", || {}))
            .with_action(Action::nullary("light.off", || {}))
            .with_action(Action::nullary("blinds.close", || {}))
    }

    fn source(contents: &str) -> ScriptSource {
        ScriptSource {
            id: "rules".to_string(),
            path: PathBuf::from("/scripts/rules.toml"),
            contents: contents.to_string(),
        }
    }

    fn parse(contents: &str) -> Result<ParsedRuleFile, LoadError> {
        TomlScriptLoader::new(vocabulary()).parse(&source(contents))
    }

    fn schema_error(result: Result<ParsedRuleFile, LoadError>) -> SchemaError {
        match result {
            Err(LoadError::Schema { source, .. }) => source,
            other => panic!("expected a schema error, got {:?}", other.map(|p| p.schema)),
        }
    }

    #[test]
    fn test_unconditional_rule() {
        let parsed = parse(
            r#"
            [[rules]]
            event = "motion"
            actions = ["light.on"]
            "#,
        )
        .expect("rule file should parse");

        let schema = build_event_schema(parsed.schema).expect("schema should build");
        let entry = schema.get(&EventKind::bus("motion")).expect("motion entry");
        assert_eq!(entry.flat_names(), vec!["light.on"]);
    }

    #[test]
    fn test_branches_and_groups() {
        let parsed = parse(
            r#"
            [groups]
            evening = ["light.on", "blinds.close"]

            [[rules]]
            event = "state:input_select.switch"
            first_match = true

              [[rules.when]]
              condition = "is_night & !away"
              actions = ["@evening"]

              [[rules.when]]
              condition = "is_day"
              actions = ["light.off"]
            "#,
        )
        .expect("rule file should parse");

        let schema = build_event_schema(parsed.schema).expect("schema should build");
        let entry = schema
            .get(&EventKind::state("input_select.switch"))
            .expect("state entry");
        match entry.as_ref() {
            ConditionSchema::Conditional { items, exclusive } => {
                assert!(*exclusive);
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].condition.name(), "(is_night & !away)");
                assert_eq!(items[0].actions.iter().next().map(|a| a.name()), Some("@evening"));
                assert_eq!(items[0].actions.flat_names(), vec!["light.on", "blinds.close"]);
                assert_eq!(items[1].condition.name(), "is_day");
            }
            other => panic!("expected branches, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_branches_flatten() {
        let parsed = parse(
            r#"
            [[rules]]
            event = "motion"

              [[rules.when]]
              condition = "is_night"

                [[rules.when.when]]
                condition = "away | is_day"
                actions = ["light.off"]
            "#,
        )
        .expect("rule file should parse");

        let schema = build_event_schema(parsed.schema).expect("schema should build");
        match schema.get(&EventKind::bus("motion")).map(|s| s.as_ref()) {
            Some(ConditionSchema::Conditional { items, .. }) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].condition.name(), "(is_night & (away | is_day))");
            }
            other => panic!("expected branches, got {:?}", other),
        }
    }

    #[test]
    fn test_sleep_defers_the_rest() {
        let parsed = parse(
            r#"
            [[rules]]
            event = "motion"
            actions = ["light.on", "sleep:2s", "light.off"]
            "#,
        )
        .expect("rule file should parse");

        let schema = build_event_schema(parsed.schema).expect("schema should build");
        match schema.get(&EventKind::bus("motion")).map(|s| s.as_ref()) {
            Some(ConditionSchema::Unconditional(actions)) => {
                let names: Vec<&str> = actions.iter().map(|a| a.name()).collect();
                assert_eq!(names, vec!["light.on", "after 2s"]);
                assert!(actions.iter().nth(1).is_some_and(|a| a.is_deferred()));
            }
            other => panic!("expected unconditional actions, got {:?}", other),
        }
    }

    #[test]
    fn test_group_cycle_is_rejected() {
        let error = schema_error(parse(
            r#"
            [groups]
            a = ["light.on", "@b"]
            b = ["@a"]
            "#,
        ));
        assert!(matches!(error, SchemaError::Cycle(_)));
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let error = schema_error(parse(
            r#"
            [[rules]]
            event = "motion"
            actions = ["light.explode"]
            "#,
        ));
        assert_eq!(
            error,
            SchemaError::UnknownName {
                what: "action",
                name: "light.explode".to_string()
            }
        );

        let error = schema_error(parse(
            r#"
            [[rules]]
            event = "motion"
              [[rules.when]]
              condition = "is_full_moon"
              actions = []
            "#,
        ));
        assert!(matches!(error, SchemaError::UnknownName { what: "condition", .. }));

        let error = schema_error(parse(
            r#"
            [[rules]]
            event = "motion"
            actions = ["@missing"]
            "#,
        ));
        assert!(matches!(error, SchemaError::UnknownName { what: "group", .. }));
    }

    #[test]
    fn test_malformed_files() {
        assert!(matches!(
            parse("rules = 3"),
            Err(LoadError::Parse { .. })
        ));

        let error = schema_error(parse(
            r#"
            [[rules]]
            event = "motion"
            "#,
        ));
        assert!(matches!(error, SchemaError::Invalid(_)));

        let error = schema_error(parse(
            r#"
            [[rules]]
            event = "motion"
              [[rules.when]]
              condition = "is_night &"
              actions = []
            "#,
        ));
        assert!(matches!(error, SchemaError::Invalid(_)));
    }

    #[test]
    fn test_settings_and_script_are_carried() {
        let parsed = parse(
            r#"
            script = "presence_logger"

            [settings]
            greeting = "hi"
            "#,
        )
        .expect("rule file should parse");

        assert_eq!(parsed.script.as_deref(), Some("presence_logger"));
        assert_eq!(
            parsed.settings.get("greeting").and_then(|v| v.as_str()),
            Some("hi")
        );
        assert!(parsed.schema.is_empty());
    }

    #[test]
    fn test_state_filter_terms() {
        let parsed = parse(
            r#"
            [[rules]]
            event = "state:light.hall"

              [[rules.when]]
              condition = "old:off & new:on, dimmed"
              actions = ["blinds.close"]
            "#,
        )
        .expect("rule file should parse");

        let schema = build_event_schema(parsed.schema).expect("schema should build");
        let item = match schema.get(&EventKind::state("light.hall")).map(|s| s.as_ref()) {
            Some(ConditionSchema::Conditional { items, .. }) => items[0].clone(),
            other => panic!("expected branches, got {:?}", other),
        };
        assert_eq!(item.condition.name(), "(old_states[off] & new_states[dimmed, on])");

        let change = |old: &str, new: &str| EventPayload::State {
            entity_id: "light.hall".into(),
            old: Some(old.into()),
            new: Some(new.into()),
        };
        assert_eq!(item.condition.evaluate(&change("off", "dimmed")), Ok(true));
        assert_eq!(item.condition.evaluate(&change("on", "dimmed")), Ok(false));

        let error = schema_error(parse(
            r#"
            [[rules]]
            event = "state:light.hall"
              [[rules.when]]
              condition = "new:on,"
              actions = []
            "#,
        ));
        assert!(matches!(error, SchemaError::Invalid(_)));
    }

    #[test]
    fn test_first_match_with_top_level_actions_is_rejected() {
        let error = schema_error(parse(
            r#"
            [[rules]]
            event = "motion"
            actions = ["light.on"]
            first_match = true

              [[rules.when]]
              condition = "is_day"
              actions = ["light.off"]
            "#,
        ));
        assert!(matches!(error, SchemaError::Invalid(message) if message.contains("first_match")));
    }

    #[test]
    fn test_restart_can_be_turned_off_per_rule() {
        let parsed = parse(
            r#"
            [[rules]]
            event = "motion"
            actions = ["light.on", "sleep:1m", "light.off"]

            [[rules]]
            event = "doorbell"
            restart = false
            actions = ["light.on"]
            "#,
        )
        .expect("rule file should parse");

        let schema = build_event_schema(parsed.schema).expect("schema should build");
        let mode = |key: &str| schema.entry(&EventKind::bus(key)).map(|(_, mode)| mode);
        assert_eq!(mode("motion"), Some(TriggerMode::Restart));
        assert_eq!(mode("doorbell"), Some(TriggerMode::Parallel));
    }

    #[test]
    fn test_states_become_rules() {
        let parsed = parse(
            r#"
            [[states]]
            name = "evening"
            condition = "is_night"
            actions = ["light.on"]
            depend_on = [["home", "!away_mode"]]

            [[states]]
            name = "home"
            condition = "is_day"
            activated_by = [{ entity = "person.me", to = ["home"] }]

            [[states]]
            name = "away_mode"
            condition = "away"
            affect_by = [{ entity = "input_boolean.away" }]
            "#,
        )
        .expect("rule file should parse");

        let schema = build_event_schema(parsed.schema).expect("schema should build");
        let branch = |entity: &str| match schema.get(&EventKind::state(entity)).map(|s| s.as_ref()) {
            Some(ConditionSchema::Conditional { items, .. }) => {
                (items[0].condition.name().to_string(), items[0].actions.flat_names().join(","))
            }
            other => panic!("expected branches, got {:?}", other),
        };

        assert_eq!(
            branch("person.me"),
            ("(new_states[home] & !away)".to_string(), "light.on".to_string())
        );
        assert_eq!(
            branch("input_boolean.away"),
            ("(!away & is_day)".to_string(), "light.on".to_string())
        );
    }

    #[test]
    fn test_invalid_states_are_rejected() {
        let error = schema_error(parse(
            r#"
            [[states]]
            name = "evening"
            condition = "is_night"
            actions = ["light.on"]
            depend_on = [["missing"]]
            "#,
        ));
        assert!(matches!(error, SchemaError::UnknownName { what: "state", .. }));

        let error = schema_error(parse(
            r#"
            [[states]]
            name = "lonely"
            condition = "is_night"
            actions = ["light.on"]
            "#,
        ));
        assert!(matches!(error, SchemaError::Invalid(_)));
    }
}
