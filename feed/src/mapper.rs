//! The feed mapper: a deterministic translator from raw hook events into
//! typed, sequenced feed events.
//!
//! The mapper is a pure state machine. It never suspends, performs no I/O,
//! and is the sole constructor of [`FeedEvent`]s. `seq` is strictly monotonic
//! across the mapper's lifetime, including across run boundaries and across
//! bootstrap from a store snapshot.

use std::collections::HashMap;
use std::collections::HashSet;

use athena_protocol::decision::DecisionIntent;
use athena_protocol::decision::DecisionKind;
use athena_protocol::decision::DecisionSource;
use athena_protocol::decision::RuntimeDecision;
use athena_protocol::feed::AgentMessageData;
use athena_protocol::feed::Cause;
use athena_protocol::feed::CompactPreData;
use athena_protocol::feed::ConfigChangeData;
use athena_protocol::feed::DecisionRecord;
use athena_protocol::feed::FeedBody;
use athena_protocol::feed::FeedEvent;
use athena_protocol::feed::FeedKind;
use athena_protocol::feed::FeedLevel;
use athena_protocol::feed::NotificationData;
use athena_protocol::feed::PermissionDecisionData;
use athena_protocol::feed::PermissionRequestData;
use athena_protocol::feed::RunEndData;
use athena_protocol::feed::RunStartData;
use athena_protocol::feed::SessionEndData;
use athena_protocol::feed::SessionStartData;
use athena_protocol::feed::SetupData;
use athena_protocol::feed::StopDecisionData;
use athena_protocol::feed::StopRequestData;
use athena_protocol::feed::SubagentStartData;
use athena_protocol::feed::SubagentStopData;
use athena_protocol::feed::TaskCompletedData;
use athena_protocol::feed::TeammateIdleData;
use athena_protocol::feed::ToolFailureData;
use athena_protocol::feed::ToolPostData;
use athena_protocol::feed::ToolPreData;
use athena_protocol::feed::UiHints;
use athena_protocol::feed::UnknownHookData;
use athena_protocol::feed::UserPromptData;
use athena_protocol::feed::format_event_id;
use athena_protocol::feed::format_run_id;
use athena_protocol::hook::HookEventName;
use athena_protocol::hook::RuntimeEvent;
use athena_protocol::session::ACTOR_ROOT_AGENT;
use athena_protocol::session::ACTOR_SYSTEM;
use athena_protocol::session::ACTOR_USER;
use athena_protocol::session::Actor;
use athena_protocol::session::ActorKind;
use athena_protocol::session::Run;
use athena_protocol::session::RunActors;
use athena_protocol::session::RunStatus;
use athena_protocol::session::RunTrigger;
use athena_protocol::session::RunTriggerKind;
use athena_protocol::session::Session;
use athena_protocol::session::SessionSource;
use athena_protocol::session::builtin_actors;
use athena_protocol::session::subagent_actor_id;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::titles;

/// Snapshot used to rehydrate a mapper from a durable store on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapperBootstrap {
    pub feed_events: Vec<FeedEvent>,
    pub adapter_session_ids: Vec<String>,
    pub created_at_ms: i64,
}

#[derive(Debug)]
pub struct FeedMapper {
    current_session: Option<Session>,
    current_run: Option<Run>,
    actors: Vec<Actor>,
    /// Next `seq` to allocate; never reset.
    seq: u64,
    /// Last run number issued; never reset so run ids stay unique.
    run_seq: u32,
    /// Last `E{n}` issued per run id, restored on bootstrap so event ids
    /// never collide with snapshot events.
    run_counters: HashMap<String, u64>,
    tool_pre_index: HashMap<String, String>,
    event_id_by_request: HashMap<String, String>,
    event_kind_by_request: HashMap<String, FeedKind>,
    active_subagents: Vec<String>,
    decision_resolved: HashSet<String>,
}

impl Default for FeedMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedMapper {
    pub fn new() -> Self {
        Self {
            current_session: None,
            current_run: None,
            actors: builtin_actors(),
            seq: 0,
            run_seq: 0,
            run_counters: HashMap::new(),
            tool_pre_index: HashMap::new(),
            event_id_by_request: HashMap::new(),
            event_kind_by_request: HashMap::new(),
            active_subagents: Vec::new(),
            decision_resolved: HashSet::new(),
        }
    }

    /// Rehydrate mapper state from a store snapshot.
    ///
    /// Seq continues strictly after the highest snapshot seq; run and event
    /// counters continue from the snapshot so no id collides. The current run
    /// stays closed until the next `ensure_run`.
    pub fn from_bootstrap(bootstrap: &MapperBootstrap) -> Self {
        let mut mapper = Self::new();

        for event in &bootstrap.feed_events {
            mapper.seq = mapper.seq.max(event.seq.saturating_add(1));

            if let Some((run_id, index)) = split_event_id(&event.event_id) {
                let counter = mapper.run_counters.entry(run_id.to_string()).or_insert(0);
                *counter = (*counter).max(index);
            }
            if let Some(run_seq) = parse_run_seq(&event.run_id) {
                mapper.run_seq = mapper.run_seq.max(run_seq);
            }

            match &event.body {
                FeedBody::SessionStart(data) => {
                    mapper.current_session = Some(Session {
                        session_id: event.session_id.clone(),
                        started_at_ms: event.ts_ms,
                        ended_at_ms: None,
                        source: data.source.clone(),
                        model: data.model.clone(),
                        agent_type: data.agent_type.clone(),
                    });
                }
                FeedBody::SessionEnd(_) => {
                    if let Some(session) = &mut mapper.current_session {
                        session.ended_at_ms = Some(event.ts_ms);
                    }
                }
                FeedBody::SubagentStart(data) => {
                    mapper.register_subagent(&data.agent_id, data.agent_type.as_deref());
                }
                _ => {}
            }
        }

        // Subagents from the snapshot are part of the registry for display,
        // but none of them is active in the fresh process.
        mapper.active_subagents.clear();
        mapper
    }

    pub fn session(&self) -> Option<&Session> {
        self.current_session.as_ref()
    }

    pub fn current_run(&self) -> Option<&Run> {
        self.current_run.as_ref()
    }

    pub fn actors(&self) -> &[Actor] {
        &self.actors
    }

    /// Allocate a seq for an externally synthesized item so it shares the
    /// feed's total order.
    pub fn allocate_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    /// UI-triggered notification (e.g. a task snapshot). Routed through the
    /// mapper so it stays the sole constructor of feed events.
    pub fn synthesize_notification(&mut self, ts_ms: i64, message: String) -> FeedEvent {
        let run_id = self.fallback_run_id();
        self.emit(
            run_id,
            ts_ms,
            FeedLevel::Info,
            ACTOR_SYSTEM.to_string(),
            Cause::default(),
            titles::notification(&message),
            FeedBody::Notification(NotificationData { message }),
            None,
            None,
        )
    }

    /// Translate one hook event into zero or more feed events.
    pub fn map_event(&mut self, event: &RuntimeEvent) -> Vec<FeedEvent> {
        match event.hook.clone() {
            HookEventName::SessionStart => self.on_session_start(event),
            HookEventName::SessionEnd => self.on_session_end(event),
            HookEventName::UserPromptSubmit => self.on_user_prompt(event),
            HookEventName::PreToolUse => self.on_pre_tool_use(event),
            HookEventName::PostToolUse => self.on_post_tool_use(event, false),
            HookEventName::PostToolUseFailure => self.on_post_tool_use(event, true),
            HookEventName::PermissionRequest => self.on_permission_request(event),
            HookEventName::Stop => self.on_stop(event),
            HookEventName::SubagentStart => self.on_subagent_start(event),
            HookEventName::SubagentStop => self.on_subagent_stop(event),
            HookEventName::Notification => self.on_simple(event, |payload| {
                let message = string_field(payload, "message").unwrap_or_default();
                (
                    titles::notification(&message),
                    FeedBody::Notification(NotificationData { message }),
                    None,
                )
            }),
            HookEventName::PreCompact => self.on_simple(event, |payload| {
                (
                    titles::compact_pre(),
                    FeedBody::CompactPre(CompactPreData {
                        trigger: string_field(payload, "trigger"),
                    }),
                    collapsed(),
                )
            }),
            HookEventName::Setup => self.on_simple(event, |_| {
                (titles::setup(), FeedBody::Setup(SetupData {}), collapsed())
            }),
            HookEventName::TeammateIdle => self.on_simple(event, |payload| {
                let teammate_name = string_field(payload, "teammate_name");
                (
                    titles::teammate_idle(teammate_name.as_deref()),
                    FeedBody::TeammateIdle(TeammateIdleData { teammate_name }),
                    collapsed(),
                )
            }),
            HookEventName::TaskCompleted => self.on_simple(event, |payload| {
                let task_subject = string_field(payload, "task_subject");
                (
                    titles::task_completed(task_subject.as_deref()),
                    FeedBody::TaskCompleted(TaskCompletedData {
                        task_id: string_field(payload, "task_id"),
                        task_subject,
                    }),
                    None,
                )
            }),
            HookEventName::ConfigChange => self.on_simple(event, |payload| {
                let description = string_field(payload, "description");
                (
                    titles::config_change(description.as_deref()),
                    FeedBody::ConfigChange(ConfigChangeData { description }),
                    collapsed(),
                )
            }),
            HookEventName::Other(name) => self.on_unknown(event, &name),
        }
    }

    /// Correlate a decision back to its originating request.
    ///
    /// Returns `None` for unknown or late request ids, for requests that do
    /// not record decisions in the feed, and for a second decision on the
    /// same request id.
    pub fn map_decision(
        &mut self,
        request_id: &str,
        decision: &RuntimeDecision,
    ) -> Option<FeedEvent> {
        let kind = *self.event_kind_by_request.get(request_id)?;
        if !matches!(kind, FeedKind::PermissionRequest | FeedKind::StopRequest) {
            return None;
        }
        if self.decision_resolved.contains(request_id) {
            return None;
        }
        self.decision_resolved.insert(request_id.to_string());

        let parent_event_id = self.event_id_by_request.get(request_id).cloned();
        let run_id = parent_event_id
            .as_deref()
            .and_then(|id| split_event_id(id).map(|(run_id, _)| run_id.to_string()))
            .unwrap_or_else(|| self.fallback_run_id());

        let record = decision_record(decision);
        if matches!(
            record,
            DecisionRecord::Deny { .. } | DecisionRecord::Block { .. }
        ) && let Some(run) = &mut self.current_run
        {
            run.counters.blocks += 1;
        }

        let actor_id = match decision.source {
            DecisionSource::User => ACTOR_USER.to_string(),
            _ => ACTOR_SYSTEM.to_string(),
        };
        let title = titles::decision(&record);
        let source = decision.source.as_str().to_string();
        let body = match kind {
            FeedKind::PermissionRequest => FeedBody::PermissionDecision(PermissionDecisionData {
                decision: record,
                source,
            }),
            _ => FeedBody::StopDecision(StopDecisionData {
                decision: record,
                source,
            }),
        };
        let cause = Cause {
            hook_request_id: Some(request_id.to_string()),
            parent_event_id,
            ..Cause::default()
        };

        Some(self.emit(run_id, now_from_mapper(), FeedLevel::Info, actor_id, cause, title, body, None, None))
    }

    fn on_session_start(&mut self, event: &RuntimeEvent) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        if let Some(run_end) = self.close_run(RunStatus::Completed, event.timestamp_ms) {
            events.push(run_end);
        }

        let source = string_field(&event.payload, "source")
            .map(SessionSource::from)
            .unwrap_or(SessionSource::Startup);
        let model = string_field(&event.payload, "model");
        let agent_type = string_field(&event.payload, "agent_type");

        self.current_session = Some(Session {
            session_id: event.session_id.clone(),
            started_at_ms: event.timestamp_ms,
            ended_at_ms: None,
            source: source.clone(),
            model: model.clone(),
            agent_type: agent_type.clone(),
        });

        let run_id = self.fallback_run_id();
        events.push(self.emit(
            run_id,
            event.timestamp_ms,
            FeedLevel::Info,
            ACTOR_SYSTEM.to_string(),
            cause_for(event),
            titles::session_start(&source, model.as_deref()),
            FeedBody::SessionStart(SessionStartData {
                source: source.clone(),
                model,
                agent_type,
            }),
            None,
            None,
        ));

        if source.reopens_run() {
            events.push(self.open_run(
                RunTriggerKind::from(&source),
                None,
                event.timestamp_ms,
            ));
        }

        events
    }

    fn on_session_end(&mut self, event: &RuntimeEvent) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        if let Some(run_end) = self.close_run(RunStatus::Completed, event.timestamp_ms) {
            events.push(run_end);
        }

        let run_id = self.fallback_run_id();
        events.push(self.emit(
            run_id,
            event.timestamp_ms,
            FeedLevel::Info,
            ACTOR_SYSTEM.to_string(),
            cause_for(event),
            titles::session_end(),
            FeedBody::SessionEnd(SessionEndData {
                reason: string_field(&event.payload, "reason"),
            }),
            None,
            None,
        ));

        if let Some(session) = &mut self.current_session {
            session.ended_at_ms = Some(event.timestamp_ms);
        }

        events
    }

    fn on_user_prompt(&mut self, event: &RuntimeEvent) -> Vec<FeedEvent> {
        self.ensure_session(event);
        let prompt = string_field(&event.payload, "prompt").unwrap_or_default();
        let preview = titles::preview(&prompt, titles::PROMPT_PREVIEW_CHARS);

        let mut events = self.ensure_run(
            RunTriggerKind::UserPromptSubmit,
            Some(preview.clone()),
            event.timestamp_ms,
        );

        let run_id = self.fallback_run_id();
        events.push(self.emit(
            run_id,
            event.timestamp_ms,
            FeedLevel::Info,
            ACTOR_USER.to_string(),
            cause_for(event),
            titles::user_prompt(&preview),
            FeedBody::UserPrompt(UserPromptData {
                prompt,
                cwd: event.context.cwd.clone(),
                permission_mode: string_field(&event.payload, "permission_mode"),
            }),
            None,
            None,
        ));
        self.index_request(event, FeedKind::UserPrompt, &events);
        events
    }

    fn on_pre_tool_use(&mut self, event: &RuntimeEvent) -> Vec<FeedEvent> {
        self.ensure_session(event);
        let mut events = self.ensure_run(RunTriggerKind::Other, None, event.timestamp_ms);

        if let Some(run) = &mut self.current_run {
            run.counters.tool_uses += 1;
        }

        let tool_name = event.tool_name.clone().unwrap_or_default();
        let actor_id = self.current_agent_actor();
        let run_id = self.fallback_run_id();
        let feed_event = self.emit(
            run_id,
            event.timestamp_ms,
            FeedLevel::Info,
            actor_id,
            cause_for(event),
            titles::tool_pre(&tool_name),
            FeedBody::ToolPre(ToolPreData {
                tool_name,
                tool_input: event.payload.get("tool_input").cloned(),
            }),
            None,
            None,
        );

        if let Some(tool_use_id) = &event.tool_use_id {
            self.tool_pre_index
                .insert(tool_use_id.clone(), feed_event.event_id.clone());
        }
        events.push(feed_event);
        self.index_request(event, FeedKind::ToolPre, &events);
        events
    }

    fn on_post_tool_use(&mut self, event: &RuntimeEvent, failed: bool) -> Vec<FeedEvent> {
        self.ensure_session(event);
        let mut events = self.ensure_run(RunTriggerKind::Other, None, event.timestamp_ms);

        if failed && let Some(run) = &mut self.current_run {
            run.counters.tool_failures += 1;
        }

        let tool_name = event.tool_name.clone().unwrap_or_default();
        let parent_event_id = event
            .tool_use_id
            .as_ref()
            .and_then(|tool_use_id| self.tool_pre_index.get(tool_use_id).cloned());

        let mut cause = cause_for(event);
        cause.parent_event_id = parent_event_id;

        let (level, title, body, kind) = if failed {
            let error = string_field(&event.payload, "error").unwrap_or_default();
            (
                FeedLevel::Error,
                titles::tool_failure(&tool_name, &error),
                FeedBody::ToolFailure(ToolFailureData {
                    tool_name,
                    error,
                    is_interrupt: event
                        .payload
                        .get("is_interrupt")
                        .and_then(Value::as_bool),
                }),
                FeedKind::ToolFailure,
            )
        } else {
            (
                FeedLevel::Info,
                titles::tool_post(&tool_name),
                FeedBody::ToolPost(ToolPostData {
                    tool_name,
                    tool_response: event.payload.get("tool_response").cloned(),
                }),
                FeedKind::ToolPost,
            )
        };

        let actor_id = self.current_agent_actor();
        let run_id = self.fallback_run_id();
        events.push(self.emit(
            run_id,
            event.timestamp_ms,
            level,
            actor_id,
            cause,
            title,
            body,
            None,
            None,
        ));
        self.index_request(event, kind, &events);
        events
    }

    fn on_permission_request(&mut self, event: &RuntimeEvent) -> Vec<FeedEvent> {
        self.ensure_session(event);
        let mut events = self.ensure_run(RunTriggerKind::Other, None, event.timestamp_ms);

        if let Some(run) = &mut self.current_run {
            run.counters.permission_requests += 1;
        }

        let tool_name = event.tool_name.clone().unwrap_or_default();
        let actor_id = self.current_agent_actor();
        let run_id = self.fallback_run_id();
        events.push(self.emit(
            run_id,
            event.timestamp_ms,
            FeedLevel::Info,
            actor_id,
            cause_for(event),
            titles::permission_request(&tool_name),
            FeedBody::PermissionRequest(PermissionRequestData {
                tool_name,
                tool_input: event.payload.get("tool_input").cloned(),
                suggestions: event.payload.get("suggestions").cloned(),
            }),
            None,
            None,
        ));
        self.index_request(event, FeedKind::PermissionRequest, &events);
        events
    }

    fn on_stop(&mut self, event: &RuntimeEvent) -> Vec<FeedEvent> {
        self.ensure_session(event);
        let mut events = self.ensure_run(RunTriggerKind::Other, None, event.timestamp_ms);

        let run_id = self.fallback_run_id();
        let stop_event = self.emit(
            run_id.clone(),
            event.timestamp_ms,
            FeedLevel::Info,
            ACTOR_ROOT_AGENT.to_string(),
            cause_for(event),
            titles::stop_request(),
            FeedBody::StopRequest(StopRequestData {
                stop_hook_active: event
                    .payload
                    .get("stop_hook_active")
                    .and_then(Value::as_bool),
            }),
            None,
            None,
        );
        let stop_event_id = stop_event.event_id.clone();
        events.push(stop_event);
        self.index_request(event, FeedKind::StopRequest, &events);

        if let Some(text) = string_field(&event.payload, "last_assistant_message")
            && !text.is_empty()
        {
            let mut cause = cause_for(event);
            cause.parent_event_id = Some(stop_event_id);
            events.push(self.emit(
                run_id,
                event.timestamp_ms,
                FeedLevel::Info,
                ACTOR_ROOT_AGENT.to_string(),
                cause,
                titles::agent_message(&text),
                FeedBody::AgentMessage(AgentMessageData { text }),
                None,
                None,
            ));
        }

        events
    }

    fn on_subagent_start(&mut self, event: &RuntimeEvent) -> Vec<FeedEvent> {
        self.ensure_session(event);
        let mut events = self.ensure_run(RunTriggerKind::Other, None, event.timestamp_ms);

        let agent_id = event.agent_id.clone().unwrap_or_default();
        let actor_id = self.register_subagent(&agent_id, event.agent_type.as_deref());
        self.active_subagents.push(actor_id.clone());
        if let Some(run) = &mut self.current_run
            && !run.actors.subagent_ids.contains(&actor_id)
        {
            run.actors.subagent_ids.push(actor_id.clone());
        }

        let run_id = self.fallback_run_id();
        events.push(self.emit(
            run_id,
            event.timestamp_ms,
            FeedLevel::Info,
            actor_id,
            cause_for(event),
            titles::subagent_start(&agent_id, event.agent_type.as_deref()),
            FeedBody::SubagentStart(SubagentStartData {
                agent_id,
                agent_type: event.agent_type.clone(),
            }),
            None,
            None,
        ));
        self.index_request(event, FeedKind::SubagentStart, &events);
        events
    }

    fn on_subagent_stop(&mut self, event: &RuntimeEvent) -> Vec<FeedEvent> {
        self.ensure_session(event);
        let mut events = self.ensure_run(RunTriggerKind::Other, None, event.timestamp_ms);

        let agent_id = event.agent_id.clone().unwrap_or_default();
        let actor_id = subagent_actor_id(&agent_id);
        // Pop by value: subagents do not necessarily stop in LIFO order.
        if let Some(position) = self
            .active_subagents
            .iter()
            .position(|active| active == &actor_id)
        {
            self.active_subagents.remove(position);
        }

        let run_id = self.fallback_run_id();
        events.push(self.emit(
            run_id,
            event.timestamp_ms,
            FeedLevel::Info,
            actor_id,
            cause_for(event),
            titles::subagent_stop(&agent_id),
            FeedBody::SubagentStop(SubagentStopData {
                agent_id,
                agent_transcript_path: string_field(&event.payload, "agent_transcript_path"),
            }),
            None,
            None,
        ));
        self.index_request(event, FeedKind::SubagentStop, &events);
        events
    }

    fn on_simple<F>(&mut self, event: &RuntimeEvent, build: F) -> Vec<FeedEvent>
    where
        F: FnOnce(&Value) -> (String, FeedBody, Option<UiHints>),
    {
        self.ensure_session(event);
        let mut events = self.ensure_run(RunTriggerKind::Other, None, event.timestamp_ms);

        let (title, body, ui) = build(&event.payload);
        let kind = body.kind();
        let run_id = self.fallback_run_id();
        events.push(self.emit(
            run_id,
            event.timestamp_ms,
            FeedLevel::Info,
            ACTOR_SYSTEM.to_string(),
            cause_for(event),
            title,
            body,
            None,
            ui,
        ));
        self.index_request(event, kind, &events);
        events
    }

    fn on_unknown(&mut self, event: &RuntimeEvent, hook_event_name: &str) -> Vec<FeedEvent> {
        self.ensure_session(event);
        let mut events = self.ensure_run(RunTriggerKind::Other, None, event.timestamp_ms);

        let run_id = self.fallback_run_id();
        events.push(self.emit(
            run_id,
            event.timestamp_ms,
            FeedLevel::Debug,
            ACTOR_SYSTEM.to_string(),
            cause_for(event),
            titles::unknown_hook(hook_event_name),
            FeedBody::UnknownHook(UnknownHookData {
                hook_event_name: hook_event_name.to_string(),
            }),
            Some(event.payload.clone()),
            collapsed(),
        ));
        self.index_request(event, FeedKind::UnknownHook, &events);
        events
    }

    /// Open a run if needed.
    ///
    /// A trigger of `Other` never replaces an open run; any other trigger
    /// closes the open run as completed and starts a fresh one.
    fn ensure_run(
        &mut self,
        trigger: RunTriggerKind,
        prompt_preview: Option<String>,
        ts_ms: i64,
    ) -> Vec<FeedEvent> {
        if self.current_run.is_some() && trigger == RunTriggerKind::Other {
            return Vec::new();
        }

        let mut events = Vec::new();
        if let Some(run_end) = self.close_run(RunStatus::Completed, ts_ms) {
            events.push(run_end);
        }
        events.push(self.open_run(trigger, prompt_preview, ts_ms));
        events
    }

    fn open_run(
        &mut self,
        trigger: RunTriggerKind,
        prompt_preview: Option<String>,
        ts_ms: i64,
    ) -> FeedEvent {
        self.clear_correlation_state();
        self.run_seq += 1;

        let session_id = self.session_id_or_unknown();
        let run_id = format_run_id(&session_id, self.run_seq);
        let trigger = RunTrigger {
            kind: trigger,
            prompt_preview,
        };
        self.current_run = Some(Run {
            run_id: run_id.clone(),
            session_id,
            started_at_ms: ts_ms,
            ended_at_ms: None,
            trigger: trigger.clone(),
            status: RunStatus::Running,
            actors: RunActors {
                root_agent_id: ACTOR_ROOT_AGENT.to_string(),
                subagent_ids: Vec::new(),
            },
            counters: Default::default(),
        });

        self.emit(
            run_id,
            ts_ms,
            FeedLevel::Info,
            ACTOR_SYSTEM.to_string(),
            Cause::default(),
            titles::run_start(trigger.kind, trigger.prompt_preview.as_deref()),
            FeedBody::RunStart(RunStartData { trigger }),
            None,
            None,
        )
    }

    fn close_run(&mut self, status: RunStatus, ts_ms: i64) -> Option<FeedEvent> {
        let mut run = self.current_run.take()?;
        run.ended_at_ms = Some(ts_ms);
        run.status = status;

        Some(self.emit(
            run.run_id.clone(),
            ts_ms,
            FeedLevel::Info,
            ACTOR_SYSTEM.to_string(),
            Cause::default(),
            titles::run_end(status),
            FeedBody::RunEnd(RunEndData {
                status,
                counters: run.counters,
            }),
            None,
            None,
        ))
    }

    fn clear_correlation_state(&mut self) {
        self.tool_pre_index.clear();
        self.event_id_by_request.clear();
        self.event_kind_by_request.clear();
        self.decision_resolved.clear();
        self.active_subagents.clear();
    }

    fn ensure_session(&mut self, event: &RuntimeEvent) {
        if self.current_session.is_none() {
            self.current_session = Some(Session {
                session_id: event.session_id.clone(),
                started_at_ms: event.timestamp_ms,
                ended_at_ms: None,
                source: SessionSource::Startup,
                model: None,
                agent_type: None,
            });
        }
    }

    fn register_subagent(&mut self, agent_id: &str, agent_type: Option<&str>) -> String {
        let actor_id = subagent_actor_id(agent_id);
        if !self.actors.iter().any(|actor| actor.actor_id == actor_id) {
            let parent = self.current_agent_actor();
            self.actors.push(Actor {
                actor_id: actor_id.clone(),
                kind: ActorKind::Subagent,
                display_name: agent_type.unwrap_or(agent_id).to_string(),
                agent_type: agent_type.map(ToOwned::to_owned),
                parent_actor_id: Some(parent),
            });
        }
        actor_id
    }

    fn current_agent_actor(&self) -> String {
        self.active_subagents
            .last()
            .cloned()
            .unwrap_or_else(|| ACTOR_ROOT_AGENT.to_string())
    }

    fn session_id_or_unknown(&self) -> String {
        self.current_session
            .as_ref()
            .map(|session| session.session_id.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// The open run's id, or the session-scoped `R0` pseudo-run for events
    /// emitted outside any run (session.start, session.end).
    fn fallback_run_id(&self) -> String {
        self.current_run
            .as_ref()
            .map(|run| run.run_id.clone())
            .unwrap_or_else(|| format_run_id(&self.session_id_or_unknown(), 0))
    }

    fn index_request(&mut self, event: &RuntimeEvent, kind: FeedKind, events: &[FeedEvent]) {
        // The request maps point at the hook's own feed event, which is the
        // last one emitted by the handler (run.start may precede it).
        let Some(feed_event) = events
            .iter()
            .rev()
            .find(|feed_event| feed_event.kind() == kind)
        else {
            return;
        };
        self.event_id_by_request
            .insert(event.id.clone(), feed_event.event_id.clone());
        self.event_kind_by_request.insert(event.id.clone(), kind);
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &mut self,
        run_id: String,
        ts_ms: i64,
        level: FeedLevel,
        actor_id: String,
        cause: Cause,
        title: String,
        body: FeedBody,
        raw: Option<Value>,
        ui: Option<UiHints>,
    ) -> FeedEvent {
        let seq = self.allocate_seq();
        let counter = self.run_counters.entry(run_id.clone()).or_insert(0);
        *counter += 1;
        let event_id = format_event_id(&run_id, *counter);

        FeedEvent {
            event_id,
            seq,
            ts_ms,
            session_id: self.session_id_or_unknown(),
            run_id,
            level,
            actor_id,
            cause,
            title,
            body,
            raw,
            ui,
        }
    }
}

fn collapsed() -> Option<UiHints> {
    Some(UiHints {
        collapsed_default: Some(true),
    })
}

fn cause_for(event: &RuntimeEvent) -> Cause {
    Cause {
        hook_request_id: Some(event.id.clone()),
        parent_event_id: None,
        tool_use_id: event.tool_use_id.clone(),
        transcript_path: event.context.transcript_path.clone(),
    }
}

fn string_field(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

/// Derive the feed-facing decision record from a runtime decision.
fn decision_record(decision: &RuntimeDecision) -> DecisionRecord {
    if decision.source == DecisionSource::Timeout {
        return DecisionRecord::NoOpinion {
            reason: "timeout".to_string(),
        };
    }

    match decision.kind {
        DecisionKind::Passthrough => DecisionRecord::NoOpinion {
            reason: decision.source.as_str().to_string(),
        },
        DecisionKind::BlockWithStderr => DecisionRecord::Block {
            reason: decision.reason.clone().unwrap_or_default(),
        },
        DecisionKind::Json => match &decision.intent {
            Some(
                DecisionIntent::PreToolAllow
                | DecisionIntent::PermissionAllow
                | DecisionIntent::QuestionAnswer { .. },
            ) => DecisionRecord::Allow,
            Some(
                DecisionIntent::PreToolDeny { reason } | DecisionIntent::PermissionDeny { reason },
            ) => DecisionRecord::Deny {
                message: if reason.is_empty() {
                    "Denied".to_string()
                } else {
                    reason.clone()
                },
            },
            None => block_shaped_record(decision.data.as_ref()),
        },
    }
}

/// A raw JSON decision with deny markers records as a block.
fn block_shaped_record(data: Option<&Value>) -> DecisionRecord {
    let Some(data) = data else {
        return DecisionRecord::Allow;
    };
    let hook_output = data.get("hookSpecificOutput").unwrap_or(data);

    let denied = hook_output
        .get("permissionDecision")
        .and_then(Value::as_str)
        .is_some_and(|decision| decision == "deny")
        || hook_output
            .get("decision")
            .and_then(|decision| decision.get("behavior"))
            .and_then(Value::as_str)
            .is_some_and(|behavior| behavior == "deny");

    if denied {
        let reason = hook_output
            .get("permissionDecisionReason")
            .or_else(|| {
                hook_output
                    .get("decision")
                    .and_then(|decision| decision.get("message"))
            })
            .and_then(Value::as_str)
            .unwrap_or("Blocked")
            .to_string();
        DecisionRecord::Block { reason }
    } else {
        DecisionRecord::Allow
    }
}

fn split_event_id(event_id: &str) -> Option<(&str, u64)> {
    let (run_id, index) = event_id.rsplit_once(":E")?;
    Some((run_id, index.parse().ok()?))
}

fn parse_run_seq(run_id: &str) -> Option<u32> {
    let (_, run_seq) = run_id.rsplit_once(":R")?;
    run_seq.parse().ok()
}

// Request events carry the forwarder's timestamp; decision events are
// stamped at mapping time.
fn now_from_mapper() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
