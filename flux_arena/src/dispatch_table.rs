//! Routing of drained envelopes to typed handlers

use std::fmt::Debug;

use rustc_hash::FxHashMap;

use crate::{
    callback::LargeCallable,
    envelope::{Envelope, TypeTag},
};

type Handler<C> = LargeCallable<dyn for<'a, 'b> FnMut(&'a mut C, &'b Envelope) -> usize>;

/// Map from payload type to the handlers interested in it
///
/// Each handler runs against a caller-supplied context `C` and receives the
/// payload already downcast to its concrete type. [dispatch](Self::dispatch)
/// has the shape [Dispatcher::drain](crate::Dispatcher::drain) expects:
///
/// ```
/// # use flux_arena::{Dispatcher, DispatchTable};
/// struct Resize(u32);
///
/// let dispatcher = Dispatcher::<flux_arena::DefaultLock>::new().unwrap();
/// let mut table = DispatchTable::<u32>::new();
/// table.on(|width: &mut u32, r: &Resize| {
///     *width = r.0;
///     1
/// });
///
/// dispatcher.publish(Resize(640)).unwrap();
/// let mut width = 0;
/// let report = dispatcher.drain(|env| table.dispatch(&mut width, env));
/// assert_eq!((report.handled, width), (1, 640));
/// ```
pub struct DispatchTable<C: 'static> {
    handlers: FxHashMap<TypeTag, Vec<Handler<C>>>,
}

impl<C: 'static> DispatchTable<C> {
    pub fn new() -> Self {
        Self {
            handlers: FxHashMap::default(),
        }
    }

    /// Register `handler` for payloads of type `P`
    ///
    /// Handlers for the same type run in registration order. The return
    /// value is added to the dispatch count.
    pub fn on<P, H>(&mut self, mut handler: H)
    where
        P: 'static,
        H: FnMut(&mut C, &P) -> usize + 'static,
    {
        let entry = Handler::<C>::from_fn(move |ctx: &mut C, envelope: &Envelope| {
            match envelope.downcast_ref::<P>() {
                Some(payload) => handler(ctx, payload),
                // tag collision, not actually ours
                None => 0,
            }
        });
        self.handlers
            .entry(TypeTag::of::<P>())
            .or_default()
            .push(entry);
    }

    /// Run every handler registered for `envelope`'s payload type
    ///
    /// Returns the sum of their results, 0 if nobody handles it.
    pub fn dispatch(&mut self, ctx: &mut C, envelope: &Envelope) -> usize {
        let Some(handlers) = self.handlers.get_mut(&envelope.tag()) else {
            tracing::trace!(tag = ?envelope.tag(), "no handler");
            return 0;
        };
        let mut handled = 0;
        for handler in handlers {
            handled += handler.call(ctx, envelope).unwrap_or(0);
        }
        handled
    }

    /// Whether any handler is registered for `P`
    pub fn handles<P: 'static>(&self) -> bool {
        self.handlers.contains_key(&TypeTag::of::<P>())
    }

    /// Number of distinct payload types with handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<C: 'static> Default for DispatchTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> Debug for DispatchTable<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.handlers.iter().map(|(tag, h)| (tag, h.len())))
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::{lock::DefaultLock, Dispatcher};

    #[derive(Default)]
    struct Context {
        clicks: Vec<(i32, i32)>,
        keys: String,
    }

    struct Click(i32, i32);
    struct Key(char);
    struct Unhandled;

    fn table() -> DispatchTable<Context> {
        let mut table = DispatchTable::new();
        table.on(|ctx: &mut Context, c: &Click| {
            ctx.clicks.push((c.0, c.1));
            1
        });
        table.on(|ctx: &mut Context, k: &Key| {
            ctx.keys.push(k.0);
            1
        });
        table
    }

    #[test]
    fn routes_by_type() {
        let mut table = table();
        assert_eq!(table.len(), 2);
        assert!(table.handles::<Click>());
        assert!(!table.handles::<Unhandled>());

        let d = Dispatcher::<DefaultLock>::new().unwrap();
        d.publish(Key('h')).unwrap();
        d.publish(Click(1, 2)).unwrap();
        d.publish(Unhandled).unwrap();
        d.publish(Key('i')).unwrap();

        let mut ctx = Context::default();
        let report = d.drain(|env| table.dispatch(&mut ctx, env));
        assert_eq!(report.dispatched, 4);
        assert_eq!(report.handled, 3);
        assert_eq!(ctx.keys, "hi");
        assert_eq!(ctx.clicks, [(1, 2)]);
    }

    #[test]
    fn several_handlers_per_type() {
        let mut table = table();
        table.on(|_: &mut Context, _: &Click| 10);

        let d = Dispatcher::<DefaultLock>::new().unwrap();
        d.publish(Click(0, 0)).unwrap();
        let mut ctx = Context::default();
        let report = d.drain(|env| table.dispatch(&mut ctx, env));
        assert_eq!(report.handled, 11);
        assert_eq!(ctx.clicks.len(), 1);
    }

    #[test]
    fn empty_table_handles_nothing() {
        let mut table = DispatchTable::<()>::default();
        assert!(table.is_empty());

        let d = Dispatcher::<DefaultLock>::new().unwrap();
        d.publish(Click(0, 0)).unwrap();
        let report = d.drain(|env| table.dispatch(&mut (), env));
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.handled, 0);
    }
}
