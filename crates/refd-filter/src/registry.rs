//! Operation registry.
//!
//! Feature modules register `(OpCode, handler)` pairs once during start-up.
//! The builder is then frozen into an immutable [`OperationRegistry`] that the
//! dispatcher walks without locking.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::request::{IoRequest, IoStatus, OpCode, PostFlags};

/// Opaque per-handler state produced in pre and consumed by the matching post.
pub type SubContext = Box<dyn Any + Send>;

/// Stable identifier assigned to each registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u32);

impl HandlerId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// What a pre-handler wants done with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreDisposition {
    /// Not interested; the post-handler is skipped.
    NoCallback,
    /// Run the post-handler after the real operation.
    WithCallback,
    /// The handler completed the request itself with the given status.
    Complete(IoStatus),
}

pub struct PreResult {
    pub disposition: PreDisposition,
    pub sub_context: Option<SubContext>,
}

impl PreResult {
    pub fn no_callback() -> Self {
        Self {
            disposition: PreDisposition::NoCallback,
            sub_context: None,
        }
    }

    pub fn with_callback() -> Self {
        Self {
            disposition: PreDisposition::WithCallback,
            sub_context: None,
        }
    }

    pub fn with_context<T: Any + Send>(sub_context: T) -> Self {
        Self {
            disposition: PreDisposition::WithCallback,
            sub_context: Some(Box::new(sub_context)),
        }
    }

    pub fn complete(status: IoStatus) -> Self {
        Self {
            disposition: PreDisposition::Complete(status),
            sub_context: None,
        }
    }
}

impl fmt::Debug for PreResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreResult")
            .field("disposition", &self.disposition)
            .field("has_sub_context", &self.sub_context.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostStatus {
    Finished,
    MoreProcessingRequired,
}

/// A pre/post handler pair for one operation code.
///
/// Both methods have defaults, so a handler only implements the side it
/// cares about. The default pre asks for the post callback; the default post
/// finishes immediately.
pub trait OperationHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_before(&self, _req: &IoRequest) -> PreResult {
        PreResult::with_callback()
    }

    fn on_after(
        &self,
        _req: &IoRequest,
        _sub_context: Option<SubContext>,
        _flags: PostFlags,
    ) -> PostStatus {
        PostStatus::Finished
    }
}

/// A feature module contributes its handlers to the registry at start-up.
pub trait FeatureModule {
    fn register(&self, registry: &mut RegistryBuilder);
}

#[derive(Clone)]
pub struct RegistryEntry {
    pub id: HandlerId,
    pub op: OpCode,
    pub handler: Arc<dyn OperationHandler>,
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("id", &self.id)
            .field("op", &self.op)
            .field("handler", &self.handler.name())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct RegistryBuilder {
    entries: Vec<RegistryEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, op: OpCode, handler: Arc<dyn OperationHandler>) -> HandlerId {
        let id = HandlerId(self.entries.len() as u32);
        tracing::debug!(handler = handler.name(), ?op, %id, "registered operation handler");
        self.entries.push(RegistryEntry { id, op, handler });
        id
    }

    pub fn add_module(&mut self, module: &dyn FeatureModule) {
        module.register(self);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(self) -> OperationRegistry {
        OperationRegistry {
            entries: self.entries,
        }
    }
}

/// Immutable, ordered handler table.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    entries: Vec<RegistryEntry>,
}

impl OperationRegistry {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter()
    }

    /// Entries for `op`, in registration order.
    pub fn matching(&self, op: OpCode) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.iter().filter(move |e| e.op == op)
    }

    pub fn ops(&self) -> Vec<OpCode> {
        let mut ops: Vec<OpCode> = Vec::new();
        for entry in &self.entries {
            if !ops.contains(&entry.op) {
                ops.push(entry.op);
            }
        }
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl OperationHandler for Named {
        fn name(&self) -> &'static str {
            self.0
        }
    }

    struct TwoOps;

    impl FeatureModule for TwoOps {
        fn register(&self, registry: &mut RegistryBuilder) {
            registry.register(OpCode::Create, Arc::new(Named("create")));
            registry.register(OpCode::Write, Arc::new(Named("write")));
        }
    }

    #[test]
    fn test_register_assigns_sequential_ids() {
        let mut builder = RegistryBuilder::new();
        let a = builder.register(OpCode::Create, Arc::new(Named("a")));
        let b = builder.register(OpCode::Create, Arc::new(Named("b")));
        assert_ne!(a, b);
        assert_eq!(a.as_u32(), 0);
        assert_eq!(b.as_u32(), 1);
    }

    #[test]
    fn test_matching_preserves_registration_order() {
        let mut builder = RegistryBuilder::new();
        builder.register(OpCode::Write, Arc::new(Named("first")));
        builder.register(OpCode::Create, Arc::new(Named("other")));
        builder.register(OpCode::Write, Arc::new(Named("second")));
        let registry = builder.build();

        let names: Vec<_> = registry
            .matching(OpCode::Write)
            .map(|e| e.handler.name())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(registry.matching(OpCode::Close).count(), 0);
    }

    #[test]
    fn test_modules_are_concatenated() {
        let mut builder = RegistryBuilder::new();
        builder.add_module(&TwoOps);
        builder.add_module(&TwoOps);
        let registry = builder.build();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.ops(), vec![OpCode::Create, OpCode::Write]);
    }

    #[test]
    fn test_default_handler_methods() {
        let handler = Named("defaults");
        let req = IoRequest::new(OpCode::Close, 1, "/x", Default::default());
        let pre = handler.on_before(&req);
        assert_eq!(pre.disposition, PreDisposition::WithCallback);
        assert!(pre.sub_context.is_none());
        assert_eq!(
            handler.on_after(&req, None, PostFlags::default()),
            PostStatus::Finished
        );
    }

    #[test]
    fn test_pre_result_with_context_downcasts() {
        let pre = PreResult::with_context(17u64);
        let sub = pre.sub_context.unwrap();
        assert_eq!(sub.downcast_ref::<u64>(), Some(&17));
    }

    #[test]
    fn test_empty_registry() {
        let registry = RegistryBuilder::new().build();
        assert!(registry.is_empty());
        assert!(registry.ops().is_empty());
    }
}
