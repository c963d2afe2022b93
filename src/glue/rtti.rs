//! src/glue/rtti.rs
//! Lightweight type identity for polymorphic containers . Replaces the hand-rolled `VP_RTTI_BASE`/`VP_RTTI_DERIVED` linked
//! list of static descriptors with `std::any::TypeId`, which gives the same
//! "is this concrete type X" query without a process-wide registry to
//! maintain.

use std::any::{Any, TypeId};

/// Implemented by every polymorphic leaf that used to carry a hand-rolled
/// RTTI descriptor (heap subtypes, async task subtypes, resource factory
/// instances). `type_id()` is the whole replacement for the macro chain.
pub trait RuntimeTyped: Any {
    fn type_id(&self) -> TypeId {
        Any::type_id(self)
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> RuntimeTyped for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Attempts a downcast on a `&dyn RuntimeTyped`, mirroring the old
/// `IsDerivedFrom<T>()` check but resolved at the type-system level instead
/// of a hand-walked descriptor chain.
pub fn downcast_ref<T: 'static>(value: &dyn RuntimeTyped) -> Option<&T> {
    value.as_any().downcast_ref::<T>()
}

pub fn downcast_mut<T: 'static>(value: &mut dyn RuntimeTyped) -> Option<&mut T> {
    value.as_any_mut().downcast_mut::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Foo(u32);
    struct Bar;

    #[test]
    fn downcast_distinguishes_concrete_types() {
        let foo = Foo(7);
        let as_typed: &dyn RuntimeTyped = &foo;
        assert!(downcast_ref::<Foo>(as_typed).is_some());
        assert!(downcast_ref::<Bar>(as_typed).is_none());
    }
}
