//! The method author interface.
//!
//! A method is a single function body that runs twice: once on the client
//! as a simulation against the local collections, and once on the server
//! with full authority against the document store. The body tells the two
//! apart through [`MethodContext::is_simulation`]; everything else it needs
//! (document access, caller identity, id generation, nested calls) goes
//! through the context it is handed, never through ambient state.

use crate::{DocumentId, Document, FieldDiff, Fields, MethodError, UserId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Default limit on nested method calls.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 16;

/// Result of running a method body.
pub type MethodResult = std::result::Result<serde_json::Value, MethodError>;

/// A method body.
pub type Handler = Arc<dyn Fn(&mut MethodContext<'_>, &serde_json::Value) -> MethodResult + Send + Sync>;

/// A server-side authorization check, run before the body.
pub type Authorizer =
    Arc<dyn Fn(Option<&str>, &serde_json::Value) -> std::result::Result<(), MethodError> + Send + Sync>;

/// Document reads and writes available to a method body.
///
/// Implemented by the client's simulation layer and by the server's
/// document store.
pub trait DocumentAccess {
    /// Get a single document's fields.
    fn find_one(&self, collection: &str, id: &str) -> Option<Fields>;

    /// All documents of a collection.
    fn find(&self, collection: &str) -> Vec<Document>;

    /// Insert a document; fails if the id is taken.
    fn insert(&mut self, collection: &str, document: Document) -> Result<(), MethodError>;

    /// Update a document. Returns false if it does not exist.
    fn update(&mut self, collection: &str, id: &str, diff: &FieldDiff) -> Result<bool, MethodError>;

    /// Remove a document. Returns false if it does not exist.
    fn remove(&mut self, collection: &str, id: &str) -> Result<bool, MethodError>;
}

/// A registered method.
#[derive(Clone)]
pub struct MethodDef {
    handler: Handler,
    authorize: Option<Authorizer>,
}

impl MethodDef {
    /// Define a method from its body.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&mut MethodContext<'_>, &serde_json::Value) -> MethodResult + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            authorize: None,
        }
    }

    /// Attach an authorization check. It runs on the server only, before
    /// the body, and is skipped by client simulations.
    pub fn authorize<F>(mut self, check: F) -> Self
    where
        F: Fn(Option<&str>, &serde_json::Value) -> std::result::Result<(), MethodError>
            + Send
            + Sync
            + 'static,
    {
        self.authorize = Some(Arc::new(check));
        self
    }

    /// Run the authorization check, if any.
    pub fn check_authorized(
        &self,
        user_id: Option<&str>,
        args: &serde_json::Value,
    ) -> std::result::Result<(), MethodError> {
        match &self.authorize {
            Some(check) => check(user_id, args),
            None => Ok(()),
        }
    }

    /// Run the body.
    pub fn run(&self, ctx: &mut MethodContext<'_>, args: &serde_json::Value) -> MethodResult {
        (self.handler)(ctx, args)
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("authorize", &self.authorize.is_some())
            .finish_non_exhaustive()
    }
}

/// Methods by name, shared between client and server.
#[derive(Debug, Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodDef>,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method body under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut MethodContext<'_>, &serde_json::Value) -> MethodResult + Send + Sync + 'static,
    {
        self.define(name, MethodDef::new(handler))
    }

    /// Register a full method definition under `name`.
    pub fn define(&mut self, name: impl Into<String>, def: MethodDef) -> &mut Self {
        self.methods.insert(name.into(), def);
        self
    }

    /// Look up a method.
    pub fn get(&self, name: &str) -> Option<&MethodDef> {
        self.methods.get(name)
    }

    /// Check if a method is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Generates document ids for inserts made by a method body.
///
/// A seeded generator produces the same sequence wherever it runs, so the
/// client simulation and the server execution of one invocation agree on
/// the ids of the documents they insert.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    seed: Option<String>,
    counter: u64,
}

impl IdGenerator {
    /// Deterministic ids derived from `seed`.
    pub fn seeded(seed: impl Into<String>) -> Self {
        Self {
            seed: Some(seed.into()),
            counter: 0,
        }
    }

    /// Random ids.
    pub fn random() -> Self {
        Self {
            seed: None,
            counter: 0,
        }
    }

    /// Produce the next id.
    pub fn next_id(&mut self) -> DocumentId {
        self.counter += 1;
        let uuid = match &self.seed {
            Some(seed) => {
                let name = format!("{seed}:{}", self.counter);
                Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
            }
            None => Uuid::new_v4(),
        };
        uuid.simple().to_string()
    }
}

/// Everything a method body can see.
pub struct MethodContext<'a> {
    invocation_id: &'a str,
    is_simulation: bool,
    user_id: Option<&'a str>,
    documents: &'a mut dyn DocumentAccess,
    ids: &'a mut IdGenerator,
    methods: &'a MethodRegistry,
    depth: usize,
    max_depth: usize,
}

impl<'a> MethodContext<'a> {
    /// Create the context of a top-level invocation.
    pub fn new(
        invocation_id: &'a str,
        is_simulation: bool,
        user_id: Option<&'a str>,
        documents: &'a mut dyn DocumentAccess,
        ids: &'a mut IdGenerator,
        methods: &'a MethodRegistry,
    ) -> Self {
        Self {
            invocation_id,
            is_simulation,
            user_id,
            documents,
            ids,
            methods,
            depth: 0,
            max_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }

    /// Override the nested call limit.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// True while running as a client-side simulation.
    pub fn is_simulation(&self) -> bool {
        self.is_simulation
    }

    /// Identity of the caller, if logged in.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id
    }

    /// The invocation this body runs for (the outermost one when nested).
    pub fn invocation_id(&self) -> &str {
        self.invocation_id
    }

    /// Nesting depth; zero for the top-level invocation.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Produce a fresh document id.
    pub fn new_id(&mut self) -> DocumentId {
        self.ids.next_id()
    }

    /// Get a single document's fields.
    pub fn find_one(&self, collection: &str, id: &str) -> Option<Fields> {
        self.documents.find_one(collection, id)
    }

    /// All documents of a collection.
    pub fn find(&self, collection: &str) -> Vec<Document> {
        self.documents.find(collection)
    }

    /// Insert a document under a fresh id and return the id.
    pub fn insert(&mut self, collection: &str, fields: Fields) -> Result<DocumentId, MethodError> {
        let id = self.new_id();
        self.documents
            .insert(collection, Document::new(id.clone(), fields))?;
        Ok(id)
    }

    /// Insert a document with a caller-chosen id.
    pub fn insert_document(&mut self, collection: &str, document: Document) -> Result<(), MethodError> {
        self.documents.insert(collection, document)
    }

    /// Update a document. Returns false if it does not exist.
    pub fn update(&mut self, collection: &str, id: &str, diff: &FieldDiff) -> Result<bool, MethodError> {
        self.documents.update(collection, id, diff)
    }

    /// Remove a document. Returns false if it does not exist.
    pub fn remove(&mut self, collection: &str, id: &str) -> Result<bool, MethodError> {
        self.documents.remove(collection, id)
    }

    /// Call another method from inside this one.
    ///
    /// The nested body runs in-process with the same simulation flag,
    /// caller and document access. During a simulation nothing is sent to
    /// the server for it: the outer invocation's server execution performs
    /// the real nested effect.
    pub fn call(&mut self, name: &str, args: &serde_json::Value) -> MethodResult {
        if self.depth >= self.max_depth {
            return Err(MethodError::domain(
                "too-many-nested-calls",
                format!("nested call to '{name}' exceeds depth {}", self.max_depth),
            ));
        }
        let methods = self.methods;
        let def = methods.get(name).ok_or_else(|| MethodError::not_found(name))?;
        if !self.is_simulation {
            def.check_authorized(self.user_id, args)?;
        }

        let mut nested = MethodContext {
            invocation_id: self.invocation_id,
            is_simulation: self.is_simulation,
            user_id: self.user_id,
            documents: &mut *self.documents,
            ids: &mut *self.ids,
            methods,
            depth: self.depth + 1,
            max_depth: self.max_depth,
        };
        def.run(&mut nested, args)
    }
}
