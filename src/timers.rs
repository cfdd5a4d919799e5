use std::collections::{BTreeSet, HashMap};
use std::rc::Weak;
use std::time::Duration;

use rquickjs::function::Opt;
use rquickjs::{Ctx, Function, Persistent, Value};

use crate::context::{live_state, ContextId, ContextState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u32);

impl TimerId {
    pub fn index(self) -> u32 {
        self.0
    }
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);

struct Timer<C> {
    context: ContextId,
    callback: C,
    due: Duration,
    interval: Option<Duration>,
}

pub(crate) struct DueTimer<C> {
    pub(crate) context: ContextId,
    pub(crate) callback: C,
}

/// Runtime-wide timer queue. `C` is the callback payload, a persistent script function in practice.
pub(crate) struct TimerManager<C> {
    now: Duration,
    next_id: u32,
    timers: HashMap<TimerId, Timer<C>>,
    schedule: BTreeSet<(Duration, TimerId)>,
}

impl<C> Default for TimerManager<C> {
    fn default() -> Self {
        Self { now: Duration::ZERO, next_id: 0, timers: HashMap::new(), schedule: BTreeSet::new() }
    }
}

impl<C: Clone> TimerManager<C> {
    pub(crate) fn add(&mut self, context: ContextId, callback: C, delay: Duration, repeat: bool) -> TimerId {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = TimerId(self.next_id);
        let due = self.now + delay;
        let interval = repeat.then(|| delay.max(MIN_INTERVAL));
        self.timers.insert(id, Timer { context, callback, due, interval });
        self.schedule.insert((due, id));
        id
    }

    pub(crate) fn clear(&mut self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some(timer) => {
                self.schedule.remove(&(timer.due, id));
                true
            }
            None => false,
        }
    }

    /// Moves the clock forward and returns the timers that came due, earliest first.
    /// An interval fires at most once per call.
    pub(crate) fn advance(&mut self, elapsed: Duration) -> Vec<DueTimer<C>> {
        self.now += elapsed;
        let mut fired = Vec::new();
        while let Some(&(due, id)) = self.schedule.first() {
            if due > self.now {
                break;
            }
            self.schedule.remove(&(due, id));
            let Some(timer) = self.timers.get(&id) else {
                continue;
            };
            if timer.interval.is_some() {
                fired.push((id, DueTimer { context: timer.context, callback: timer.callback.clone() }));
            } else if let Some(timer) = self.timers.remove(&id) {
                fired.push((id, DueTimer { context: timer.context, callback: timer.callback }));
            }
        }
        for (id, _) in &fired {
            if let Some(timer) = self.timers.get_mut(id) {
                if let Some(interval) = timer.interval {
                    timer.due = self.now + interval;
                    self.schedule.insert((timer.due, *id));
                }
            }
        }
        fired.into_iter().map(|(_, timer)| timer).collect()
    }

    pub(crate) fn clear_context(&mut self, context: ContextId) -> usize {
        let ids: Vec<TimerId> =
            self.timers.iter().filter(|(_, timer)| timer.context == context).map(|(id, _)| *id).collect();
        for id in &ids {
            self.clear(*id);
        }
        ids.len()
    }

    pub(crate) fn clear_all(&mut self) {
        self.timers.clear();
        self.schedule.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }
}

pub(crate) type ScriptTimers = TimerManager<Persistent<Function<'static>>>;

fn delay_from_millis(millis: Option<f64>) -> Duration {
    let millis = millis.filter(|value| value.is_finite()).unwrap_or(0.0).clamp(0.0, i32::MAX as f64);
    Duration::from_secs_f64(millis / 1000.0)
}

fn schedule_function<'js>(
    ctx: &Ctx<'js>,
    state: Weak<ContextState>,
    repeat: bool,
) -> rquickjs::Result<Function<'js>> {
    Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, callback: Function<'js>, delay: Opt<Value<'js>>| -> rquickjs::Result<u32> {
            let state = live_state(&ctx, &state)?;
            let delay = delay_from_millis(delay.0.and_then(|value| value.as_number()));
            let callback = Persistent::save(&ctx, callback);
            let id = state.host.timers.borrow_mut().add(state.id, callback, delay, repeat);
            Ok(id.0)
        },
    )
}

fn cancel_function<'js>(ctx: &Ctx<'js>, state: Weak<ContextState>) -> rquickjs::Result<Function<'js>> {
    Function::new(ctx.clone(), move |ctx: Ctx<'js>, id: Opt<Value<'js>>| -> rquickjs::Result<()> {
        let state = live_state(&ctx, &state)?;
        if let Some(id) = id.0.and_then(|value| value.as_number()) {
            if id >= 1.0 && id <= u32::MAX as f64 {
                state.host.timers.borrow_mut().clear(TimerId(id as u32));
            }
        }
        Ok(())
    })
}

/// Installs `setTimeout`, `setInterval`, `clearTimeout` and `clearInterval` on the global object.
pub(crate) fn register<'js>(ctx: &Ctx<'js>, state: Weak<ContextState>) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    globals.set("setTimeout", schedule_function(ctx, state.clone(), false)?)?;
    globals.set("setInterval", schedule_function(ctx, state.clone(), true)?)?;
    globals.set("clearTimeout", cancel_function(ctx, state.clone())?)?;
    globals.set("clearInterval", cancel_function(ctx, state)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn timeouts_fire_once_in_due_order() {
        let context = ContextId::new(1);
        let mut timers = TimerManager::default();
        timers.add(context, "late", ms(30), false);
        timers.add(context, "early", ms(10), false);
        assert!(timers.advance(ms(5)).is_empty());
        let fired: Vec<_> = timers.advance(ms(30)).into_iter().map(|timer| timer.callback).collect();
        assert_eq!(fired, vec!["early", "late"]);
        assert!(timers.advance(ms(100)).is_empty());
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn intervals_fire_at_most_once_per_advance() {
        let context = ContextId::new(1);
        let mut timers = TimerManager::default();
        let id = timers.add(context, "tick", ms(10), true);
        assert_eq!(timers.advance(ms(35)).len(), 1);
        assert_eq!(timers.advance(ms(10)).len(), 1);
        assert!(timers.clear(id));
        assert!(timers.advance(ms(100)).is_empty());
    }

    #[test]
    fn clearing_a_context_drops_only_its_timers() {
        let mut timers = TimerManager::default();
        timers.add(ContextId::new(1), "a", ms(1), false);
        timers.add(ContextId::new(2), "b", ms(1), false);
        assert_eq!(timers.clear_context(ContextId::new(1)), 1);
        let fired = timers.advance(ms(5));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].context, ContextId::new(2));
    }

    #[test]
    fn delays_are_sanitized() {
        assert_eq!(delay_from_millis(None), Duration::ZERO);
        assert_eq!(delay_from_millis(Some(f64::NAN)), Duration::ZERO);
        assert_eq!(delay_from_millis(Some(-5.0)), Duration::ZERO);
        assert_eq!(delay_from_millis(Some(250.0)), ms(250));
    }
}
