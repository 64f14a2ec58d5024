//! A shared todo list.
//!
//! Documents live in `todos` with fields `title`, `checked` and `owner`.

use crate::publication::{Publish, PublicationRegistry, Subscription};
use crate::store::{ObserveCallbacks, Query, Selector};
use lagless_engine::{
    fields_from_json, FieldDiff, Fields, MethodContext, MethodDef, MethodError, MethodRegistry,
    MethodResult,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub const COLLECTION: &str = "todos";

/// Collection and document the stats publication emits.
pub const STATS_COLLECTION: &str = "todos.stats";
pub const STATS_ID: &str = "all";

pub fn register_methods(methods: &mut MethodRegistry) {
    methods
        .register("todos.insert", insert)
        .register("todos.setChecked", set_checked)
        .define(
            "todos.remove",
            MethodDef::new(remove).authorize(require_user),
        )
        .define(
            "todos.clearChecked",
            MethodDef::new(clear_checked).authorize(require_user),
        );
}

pub fn register_publications(publications: &mut PublicationRegistry) {
    publications
        .publish("todos.all", |_, store, _| {
            Ok(Publish::Cursors(vec![store.find(Query::new(COLLECTION))]))
        })
        .publish("todos.mine", |sub, store, _| {
            let user_id = sub
                .user_id()
                .ok_or_else(|| MethodError::authorization("login required"))?;
            let query = Query::new(COLLECTION)
                .filter(Selector::Eq("owner".into(), json!(user_id)))
                .project(["title", "checked"]);
            Ok(Publish::Cursors(vec![store.find(query)]))
        })
        .publish("todos.stats", |sub, store, _| {
            let counter = StatsCounter::new(sub.clone());
            let handle = store.find(Query::new(COLLECTION)).observe(counter.clone());
            sub.on_stop(move || handle.stop());
            counter.publish_initial();
            Ok(Publish::Manual)
        });
}

fn require_user(user_id: Option<&str>, _args: &Value) -> Result<(), MethodError> {
    match user_id {
        Some(_) => Ok(()),
        None => Err(MethodError::authorization("login required")),
    }
}

fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str, MethodError> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| MethodError::domain("invalid-arguments", format!("'{name}' must be a string")))
}

fn insert(ctx: &mut MethodContext<'_>, args: &Value) -> MethodResult {
    let title = str_arg(args, "title").unwrap_or_default().trim();
    if title.is_empty() {
        return Err(MethodError::domain("invalid-title", "title must not be empty"));
    }

    let fields = fields_from_json(json!({
        "title": title,
        "checked": false,
        "owner": ctx.user_id(),
    }));
    let id = ctx.insert(COLLECTION, fields)?;
    Ok(json!(id))
}

fn set_checked(ctx: &mut MethodContext<'_>, args: &Value) -> MethodResult {
    let id = str_arg(args, "id")?;
    let checked = args
        .get("checked")
        .and_then(Value::as_bool)
        .ok_or_else(|| MethodError::domain("invalid-arguments", "'checked' must be a boolean"))?;

    let todo = ctx
        .find_one(COLLECTION, id)
        .ok_or_else(|| MethodError::domain("not-found", format!("todo '{id}' not found")))?;

    // Clients may not see the owner field; only the server enforces it
    if !ctx.is_simulation() {
        if let Some(owner) = todo.get("owner").and_then(Value::as_str) {
            if ctx.user_id() != Some(owner) {
                return Err(MethodError::authorization("not your todo"));
            }
        }
    }

    ctx.update(COLLECTION, id, &FieldDiff::new().set("checked", json!(checked)))?;
    Ok(Value::Null)
}

fn remove(ctx: &mut MethodContext<'_>, args: &Value) -> MethodResult {
    let id = str_arg(args, "id")?;
    Ok(json!(ctx.remove(COLLECTION, id)?))
}

fn clear_checked(ctx: &mut MethodContext<'_>, _args: &Value) -> MethodResult {
    let checked: Vec<String> = ctx
        .find(COLLECTION)
        .into_iter()
        .filter(|todo| todo.get("checked") == Some(&json!(true)))
        .map(|todo| todo.id)
        .collect();

    for id in &checked {
        ctx.call("todos.remove", &json!({ "id": id }))?;
    }
    Ok(json!(checked.len()))
}

#[derive(Default)]
struct Counts {
    /// Checked flag per todo
    todos: HashMap<String, bool>,
    published: bool,
}

impl Counts {
    fn totals(&self) -> Fields {
        let checked = self.todos.values().filter(|checked| **checked).count();
        fields_from_json(json!({ "count": self.todos.len(), "checked": checked }))
    }
}

/// Maintains the single stats document from todo changes.
#[derive(Clone)]
struct StatsCounter {
    sub: Subscription,
    counts: std::sync::Arc<Mutex<Counts>>,
}

impl StatsCounter {
    fn new(sub: Subscription) -> Self {
        Self {
            sub,
            counts: Default::default(),
        }
    }

    /// Emit the document once the initial scan is counted.
    fn publish_initial(&self) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = self
            .sub
            .emit_added(STATS_COLLECTION, STATS_ID, counts.totals())
        {
            tracing::error!(sub_id = %self.sub.id(), "Stats emit failed: {}", e);
        }
        counts.published = true;
        drop(counts);
        self.sub.mark_ready();
    }

    fn update(&self, apply: impl FnOnce(&mut HashMap<String, bool>)) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let before = counts.totals();
        apply(&mut counts.todos);
        if !counts.published {
            return;
        }
        let diff = FieldDiff::between(&before, &counts.totals());
        if let Err(e) = self.sub.emit_changed(STATS_COLLECTION, STATS_ID, diff) {
            tracing::error!(sub_id = %self.sub.id(), "Stats emit failed: {}", e);
        }
    }
}

impl ObserveCallbacks for StatsCounter {
    fn added(&self, id: &str, fields: &Fields) {
        let checked = fields.get("checked") == Some(&json!(true));
        self.update(|todos| {
            todos.insert(id.to_string(), checked);
        });
    }

    fn changed(&self, id: &str, diff: &FieldDiff) {
        if !diff.fields().any(|field| field == "checked") {
            return;
        }
        let checked = diff.set.get("checked") == Some(&json!(true));
        self.update(|todos| {
            todos.insert(id.to_string(), checked);
        });
    }

    fn removed(&self, id: &str) {
        self.update(|todos| {
            todos.remove(id);
        });
    }
}
