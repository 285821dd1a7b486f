//! The processor contract and its composition operators.

use convoy_domain::Event;

/// A pure event transformer: `(state, input) -> (state', outputs)`.
///
/// Processors hold no I/O and never read clocks; output timestamps
/// derive from the input event, which keeps `process` deterministic.
pub trait Processor: Send + Sync {
    type State: Default + Send;

    fn process(&self, state: &mut Self::State, input: &Event) -> Vec<Event>;
}

/// Run two processors in parallel on a pair of states. Both see the
/// same input; outputs concatenate `a` then `b`.
pub struct Combine<A, B> {
    a: A,
    b: B,
}

pub fn combine<A, B>(a: A, b: B) -> Combine<A, B> {
    Combine { a, b }
}

impl<A: Processor, B: Processor> Processor for Combine<A, B> {
    type State = (A::State, B::State);

    fn process(&self, state: &mut Self::State, input: &Event) -> Vec<Event> {
        let mut outputs = self.a.process(&mut state.0, input);
        outputs.extend(self.b.process(&mut state.1, input));
        outputs
    }
}

/// Run two processors sequentially: `b` sees the input and then each of
/// `a`'s outputs, accumulating everything in order.
pub struct Chain<A, B> {
    a: A,
    b: B,
}

pub fn chain<A, B>(a: A, b: B) -> Chain<A, B> {
    Chain { a, b }
}

impl<A: Processor, B: Processor> Processor for Chain<A, B> {
    type State = (A::State, B::State);

    fn process(&self, state: &mut Self::State, input: &Event) -> Vec<Event> {
        let upstream = self.a.process(&mut state.0, input);
        let mut outputs = self.b.process(&mut state.1, input);
        for event in &upstream {
            outputs.extend(self.b.process(&mut state.1, event));
        }
        let mut all = upstream;
        all.extend(outputs);
        all
    }
}
