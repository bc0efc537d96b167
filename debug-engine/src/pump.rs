// Event pump
//
// Drains the target's event stream on a background thread. Each event set
// becomes one suspend context plus one manager-thread command that
// classifies every event in delivery order and casts its vote. The pump
// itself never touches shared state.

use crate::command::{DebuggerCommand, Priority};
use crate::error::TargetResult;
use crate::events::{Event, EventKind, EventSet};
use crate::session::DebugSession;
use crate::step::StepDecision;
use crate::suspend::SuspendContext;
use crate::types::{SuspendPolicy, ThreadId};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

pub(crate) struct EventPump;

impl EventPump {
    pub(crate) fn spawn(session: &Arc<DebugSession>) {
        let session = Arc::clone(session);
        let spawned = thread::Builder::new()
            .name("debugger-event-pump".to_string())
            .spawn(move || {
                info!("event pump started");
                loop {
                    match session.target().next_event_set() {
                        Ok(set) => Self::dispatch_event_set(&session, set),
                        Err(e) => {
                            if e.is_disconnect() {
                                debug!("event stream closed");
                            } else {
                                error!("event stream failed: {}", e);
                            }
                            let teardown = Arc::clone(&session);
                            session.manager().invoke_later(DebuggerCommand::new(
                                Priority::High,
                                move || {
                                    teardown.close_process(false);
                                    Ok(())
                                },
                            ));
                            break;
                        }
                    }
                    if session.is_detached() {
                        break;
                    }
                }
                info!("event pump shutting down");
            });
        if let Err(e) = spawned {
            error!("failed to spawn event pump: {}", e);
        }
    }

    fn dispatch_event_set(session: &Arc<DebugSession>, set: EventSet) {
        debug!(
            "event set: {} events, policy {:?}",
            set.events.len(),
            set.suspend_policy
        );

        // fast path: when an active method-exit watcher consumes every event
        // in the set, resume immediately without creating a context
        if let Some(watcher) = session.method_exit_watcher() {
            if !set.events.is_empty()
                && set
                    .events
                    .iter()
                    .all(|e| matches!(e.kind, EventKind::MethodExit { .. }) && watcher.consume(e))
            {
                Self::resume_event_set(session, &set);
                return;
            }
        }

        let command_session = Arc::clone(session);
        session
            .manager()
            .invoke_later(DebuggerCommand::new(Priority::High, move || {
                Self::process_event_set(&command_session, set);
                Ok(())
            }));
    }

    /// Undo an event set's suspension without any context bookkeeping.
    fn resume_event_set(session: &Arc<DebugSession>, set: &EventSet) {
        let result = match set.suspend_policy {
            SuspendPolicy::All => session.target().resume_all(),
            SuspendPolicy::EventThread => match set.anchor_thread() {
                Some(thread) => session.target().resume_thread(thread),
                None => Ok(()),
            },
            SuspendPolicy::None => Ok(()),
        };
        if let Err(e) = result {
            if e.is_disconnect() {
                debug!("resume of watched event set hit disconnect");
            } else {
                warn!("failed to resume watched event set: {}", e);
            }
        }
    }

    fn process_event_set(session: &Arc<DebugSession>, set: EventSet) {
        let ctx = session.suspend_manager().push_context_for(&set);
        for event in &set.events {
            if let Err(e) = Self::classify_event(session, &ctx, event) {
                if e.is_disconnect() {
                    debug!("disconnect while dispatching event: {}", e);
                } else {
                    error!("event dispatch failed: {}", e);
                }
                // the abandoned event still owes its vote
                session.cast_vote(&ctx, true);
            }
        }
    }

    fn classify_event(
        session: &Arc<DebugSession>,
        ctx: &Arc<SuspendContext>,
        event: &Event,
    ) -> TargetResult<()> {
        match &event.kind {
            EventKind::VmStart { .. } => {
                info!("target process started");
                session.cast_vote(ctx, true);
            }
            EventKind::VmDeath | EventKind::Disconnected => {
                info!("target process terminated");
                session.cast_vote(ctx, true);
                session.close_process(false);
            }
            EventKind::ClassPrepare { type_name, .. } => {
                debug!("class prepared: {}", type_name);
                session.requests().class_prepared(event);
                session.cast_vote(ctx, true);
            }
            EventKind::Step { thread, .. } => {
                Self::process_step_event(session, ctx, *thread, event)?;
            }
            EventKind::Breakpoint { .. }
            | EventKind::Watchpoint { .. }
            | EventKind::MethodEntry { .. }
            | EventKind::MethodExit { .. } => {
                // re-dispatched at lower priority so other queued event sets
                // can interleave
                let locatable_session = Arc::clone(session);
                let locatable_ctx = Arc::clone(ctx);
                let locatable_event = event.clone();
                session.manager().invoke_later(
                    DebuggerCommand::new(Priority::Normal, move || {
                        Self::process_locatable_event(
                            &locatable_session,
                            &locatable_ctx,
                            &locatable_event,
                        );
                        Ok(())
                    })
                    .bound_to(Arc::clone(ctx)),
                );
            }
            EventKind::ClassUnload { type_name } => {
                debug!("class unloaded: {}", type_name);
                session.cast_vote(ctx, true);
            }
            EventKind::Unknown { kind } => {
                warn!("unrecognized event kind {}", kind);
                session.cast_vote(ctx, true);
            }
        }
        Ok(())
    }

    fn process_step_event(
        session: &Arc<DebugSession>,
        ctx: &Arc<SuspendContext>,
        thread: ThreadId,
        event: &Event,
    ) -> TargetResult<()> {
        let hint = event
            .request_id
            .and_then(|id| session.requests().step_hint_for(id));
        match hint {
            Some(hint) => {
                let decision = hint.next_step_decision(
                    session.target().as_ref(),
                    thread,
                    &session.config().step_filters,
                );
                match decision {
                    StepDecision::Continue(depth) => {
                        debug!("step filter continues with {:?}", depth);
                        session.do_step(thread, depth, hint)?;
                        session.cast_vote(ctx, true);
                    }
                    StepDecision::Stop => {
                        session.requests().delete_step_requests(thread)?;
                        if hint.is_restore_breakpoints() {
                            session.requests().enable_breakpoints();
                        }
                        info!("paused at step");
                        session.cast_vote(ctx, false);
                    }
                }
            }
            None => {
                // stale step event with no hint left for it
                session.requests().delete_step_requests(thread)?;
                session.cast_vote(ctx, false);
            }
        }
        Ok(())
    }

    fn process_locatable_event(
        session: &Arc<DebugSession>,
        ctx: &Arc<SuspendContext>,
        event: &Event,
    ) {
        if let Some(thread) = event.thread() {
            if session.suspend_manager().is_evaluating_on(thread) {
                // breakpoints are skipped while the thread runs an evaluation
                debug!("skipping breakpoint during evaluation on thread {}", thread);
                session.cast_vote(ctx, true);
                return;
            }
        }

        let resume = match session.requests().find_requestor_for(event) {
            Some(requestor) => {
                let resume = requestor.should_resume(ctx, event);
                if matches!(event.kind, EventKind::Breakpoint { .. }) {
                    // hit bookkeeping happens regardless of the verdict
                    requestor.notify_hit(event);
                }
                resume
            }
            None => true,
        };

        if resume {
            session.cast_vote(ctx, true);
        } else {
            if ctx.suspend_policy() == SuspendPolicy::All {
                if let Some(thread) = event.thread() {
                    // must precede any resume call: a resume implicitly
                    // clears such filters
                    session.requests().apply_thread_filter(thread);
                }
            }
            info!("paused at breakpoint");
            session.cast_vote(ctx, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::MethodExitWatcher;
    use crate::step::StepHint;
    use crate::testing::{RequestCall, ScriptedRequestor, TargetCall, TestHarness};
    use crate::types::{Location, SourcePosition, StepDepth};

    fn loc() -> Location {
        Location {
            class_id: 1,
            method_id: 1,
            index: 0,
        }
    }

    fn single_event_set(policy: SuspendPolicy, event: Event) -> EventSet {
        EventSet {
            suspend_policy: policy,
            events: vec![event],
        }
    }

    #[test]
    fn test_class_prepare_notifies_and_auto_resumes() {
        let harness = TestHarness::attached();
        harness.target.send_event_set(single_event_set(
            SuspendPolicy::EventThread,
            Event::new(
                Some(5),
                EventKind::ClassPrepare {
                    thread: 1,
                    type_name: "app.Loaded".into(),
                },
            ),
        ));
        harness.wait_until("class prepare processed", || {
            harness
                .requests
                .calls()
                .contains(&RequestCall::ClassPrepared("app.Loaded".into()))
        });
        harness.wait_until("context resumed", || {
            harness.session.suspend_manager().suspends_count() == 0
        });
        assert!(harness
            .target
            .calls()
            .contains(&TargetCall::ResumeThread(1)));
        assert!(!harness.session.suspend_manager().has_paused_context());
    }

    #[test]
    fn test_breakpoint_pause_applies_thread_filter_first() {
        let harness = TestHarness::attached();
        let requestor = Arc::new(ScriptedRequestor::new(false));
        harness.requests.set_requestor(requestor.clone());
        harness.target.send_event_set(single_event_set(
            SuspendPolicy::All,
            Event::new(
                Some(9),
                EventKind::Breakpoint {
                    thread: 1,
                    location: loc(),
                },
            ),
        ));
        harness.wait_until("pause published", || {
            harness.session.suspend_manager().has_paused_context()
        });
        assert_eq!(requestor.hits(), 1);
        assert!(harness
            .requests
            .calls()
            .contains(&RequestCall::ApplyThreadFilter(1)));
        // paused: the event suspension was not given back
        assert!(!harness.target.calls().contains(&TargetCall::ResumeAll));
        assert!(harness
            .listener
            .events()
            .iter()
            .any(|e| e.starts_with("paused")));
    }

    #[test]
    fn test_breakpoint_resume_verdict_auto_resumes() {
        let harness = TestHarness::attached();
        let requestor = Arc::new(ScriptedRequestor::new(true));
        harness.requests.set_requestor(requestor.clone());
        harness.target.send_event_set(single_event_set(
            SuspendPolicy::EventThread,
            Event::new(
                Some(9),
                EventKind::Breakpoint {
                    thread: 2,
                    location: loc(),
                },
            ),
        ));
        harness.wait_until("context resumed", || {
            harness.session.suspend_manager().suspends_count() == 0
        });
        assert_eq!(requestor.hits(), 1);
        assert!(harness
            .target
            .calls()
            .contains(&TargetCall::ResumeThread(2)));
        assert!(!harness.session.suspend_manager().has_paused_context());
    }

    #[test]
    fn test_breakpoints_skipped_while_thread_evaluates() {
        let harness = TestHarness::attached();
        let requestor = Arc::new(ScriptedRequestor::new(false));
        harness.requests.set_requestor(requestor);
        harness.on_manager({
            let session = Arc::clone(&harness.session);
            move || {
                let ctx = session.suspend_manager().push_suspend_context(
                    SuspendPolicy::EventThread,
                    0,
                    Some(1),
                );
                ctx.set_evaluating(Some(1));
                Ok(())
            }
        });
        harness.target.send_event_set(single_event_set(
            SuspendPolicy::EventThread,
            Event::new(
                Some(9),
                EventKind::Breakpoint {
                    thread: 1,
                    location: loc(),
                },
            ),
        ));
        harness.wait_until("breakpoint auto-resumed", || {
            harness
                .target
                .calls()
                .contains(&TargetCall::ResumeThread(1))
        });
        assert!(!harness.session.suspend_manager().has_paused_context());
    }

    #[test]
    fn test_step_stop_deletes_requests_and_pauses() {
        let harness = TestHarness::attached();
        harness
            .target
            .set_position(1, Some(SourcePosition::new("Main.x", 10)), 2);
        harness.on_manager({
            let session = Arc::clone(&harness.session);
            move || {
                let hint = StepHint::capture(StepDepth::Over, session.target().as_ref(), 1);
                session.do_step(1, StepDepth::Over, hint)
            }
        });
        let request = harness.requests.last_step_request().unwrap();

        // the step landed on a new line
        harness
            .target
            .set_position(1, Some(SourcePosition::new("Main.x", 11)), 2);
        harness.target.send_event_set(single_event_set(
            SuspendPolicy::EventThread,
            Event::new(
                Some(request),
                EventKind::Step {
                    thread: 1,
                    location: loc(),
                },
            ),
        ));
        harness.wait_until("pause published", || {
            harness.session.suspend_manager().has_paused_context()
        });
        let calls = harness.requests.calls();
        let deletes = calls
            .iter()
            .filter(|c| **c == RequestCall::DeleteSteps(1))
            .count();
        // once when the step was issued, once when it resolved
        assert_eq!(deletes, 2);
    }

    #[test]
    fn test_step_continue_issues_new_request_and_resumes() {
        let harness = TestHarness::attached();
        harness
            .target
            .set_position(1, Some(SourcePosition::new("Main.x", 10)), 2);
        harness.on_manager({
            let session = Arc::clone(&harness.session);
            move || {
                let hint = StepHint::capture(StepDepth::Over, session.target().as_ref(), 1);
                session.do_step(1, StepDepth::Over, hint)
            }
        });
        let request = harness.requests.last_step_request().unwrap();

        // same line, same depth: the step has not left the statement yet
        harness.target.send_event_set(single_event_set(
            SuspendPolicy::EventThread,
            Event::new(
                Some(request),
                EventKind::Step {
                    thread: 1,
                    location: loc(),
                },
            ),
        ));
        harness.wait_until("auto-resume", || {
            harness
                .target
                .calls()
                .contains(&TargetCall::ResumeThread(1))
        });
        let creates = harness
            .requests
            .calls()
            .iter()
            .filter(|c| matches!(c, RequestCall::CreateStep(1, StepDepth::Over)))
            .count();
        assert_eq!(creates, 2);
        assert!(!harness.session.suspend_manager().has_paused_context());
    }

    #[test]
    fn test_method_exit_watcher_fast_path_skips_context() {
        struct ConsumeAll;
        impl MethodExitWatcher for ConsumeAll {
            fn consume(&self, _event: &Event) -> bool {
                true
            }
        }

        let harness = TestHarness::attached();
        harness
            .session
            .set_method_exit_watcher(Some(Arc::new(ConsumeAll)));
        harness.target.send_event_set(single_event_set(
            SuspendPolicy::EventThread,
            Event::new(
                Some(3),
                EventKind::MethodExit {
                    thread: 2,
                    location: loc(),
                },
            ),
        ));
        harness.wait_until("fast-path resume", || {
            harness
                .target
                .calls()
                .contains(&TargetCall::ResumeThread(2))
        });
        // no context was ever created
        assert_eq!(harness.session.suspend_manager().suspends_count(), 0);
        harness.barrier();
        assert!(!harness.session.suspend_manager().has_paused_context());
    }

    #[test]
    fn test_vm_death_tears_down_session() {
        let harness = TestHarness::attached();
        harness.target.send_event_set(single_event_set(
            SuspendPolicy::None,
            Event::new(None, EventKind::VmDeath),
        ));
        harness.wait_until("session detached", || harness.session.is_detached());
        assert!(harness.listener.contains("detached(false)"));
        assert!(harness.session.manager().is_closed());
    }

    #[test]
    fn test_events_in_one_set_are_processed_in_order() {
        let harness = TestHarness::attached();
        harness.target.send_event_set(EventSet {
            suspend_policy: SuspendPolicy::EventThread,
            events: vec![
                Event::new(
                    Some(1),
                    EventKind::ClassPrepare {
                        thread: 1,
                        type_name: "app.First".into(),
                    },
                ),
                Event::new(
                    Some(2),
                    EventKind::ClassPrepare {
                        thread: 1,
                        type_name: "app.Second".into(),
                    },
                ),
            ],
        });
        harness.wait_until("both events processed", || {
            harness
                .requests
                .calls()
                .contains(&RequestCall::ClassPrepared("app.Second".into()))
        });
        let calls = harness.requests.calls();
        let first = calls
            .iter()
            .position(|c| *c == RequestCall::ClassPrepared("app.First".into()))
            .unwrap();
        let second = calls
            .iter()
            .position(|c| *c == RequestCall::ClassPrepared("app.Second".into()))
            .unwrap();
        assert!(first < second);
    }
}
