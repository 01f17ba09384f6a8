use super::*;
use crate::llm::{ChatMessage, FragmentStream, ToolArguments};
use crate::mcp::client::ToolDescriptor;
use crate::mcp::error::ProviderError;
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

enum Script {
    Fragments(Vec<anyhow::Result<StreamFragment>>),
    OpenError(String),
}

/// Model fake that replays one script per `stream_chat` call and records
/// the messages it was given.
#[derive(Default)]
struct ScriptedModel {
    scripts: StdMutex<VecDeque<Script>>,
    requests: StdMutex<Vec<(Vec<ChatMessage>, usize)>>,
    delay: Option<Duration>,
}

impl ScriptedModel {
    fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: StdMutex::new(scripts.into()),
            ..Self::default()
        }
    }

    fn requests(&self) -> Vec<(Vec<ChatMessage>, usize)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: &[ToolDef],
        _cancel: CancellationToken,
    ) -> anyhow::Result<FragmentStream> {
        self.requests
            .lock()
            .unwrap()
            .push((messages, tools.len()));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected model call");
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        match script {
            Script::Fragments(items) => Ok(Box::pin(futures::stream::iter(items))),
            Script::OpenError(msg) => Err(anyhow!(msg)),
        }
    }
}

enum FakeResponse {
    Text(String),
    Fail(fn(&str) -> ProviderError),
    CancelAndHang(CancellationToken),
}

struct FakeTools {
    tools: Vec<ToolDescriptor>,
    responses: HashMap<String, FakeResponse>,
    calls: StdMutex<Vec<(String, ToolArguments)>>,
}

impl FakeTools {
    fn new(responses: Vec<(&str, FakeResponse)>) -> Self {
        let tools = responses
            .iter()
            .map(|(name, _)| ToolDescriptor {
                name: name.to_string(),
                description: format!("{name} tool"),
                input_schema: json!({"type": "object"}),
            })
            .collect();
        Self {
            tools,
            responses: responses
                .into_iter()
                .map(|(n, r)| (n.to_string(), r))
                .collect(),
            calls: StdMutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<(String, ToolArguments)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolProvider for FakeTools {
    fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    async fn invoke(&self, name: &str, args: &ToolArguments) -> Result<String, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), args.clone()));
        match self.responses.get(name) {
            Some(FakeResponse::Text(t)) => Ok(t.clone()),
            Some(FakeResponse::Fail(f)) => Err(f(name)),
            Some(FakeResponse::CancelAndHang(token)) => {
                token.cancel();
                std::future::pending().await
            }
            None => Err(ProviderError::ToolTransport {
                name: name.to_string(),
                message: "unknown tool".into(),
            }),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    events: StdMutex<Vec<StreamEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap().clone()
    }

    fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(StreamEvent::name).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &StreamEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct BrokenSink;

impl EventSink for BrokenSink {
    fn emit(&self, _event: &StreamEvent) -> anyhow::Result<()> {
        Err(anyhow!("client went away"))
    }
}

fn text(s: &str) -> anyhow::Result<StreamFragment> {
    Ok(StreamFragment::Text(s.to_string()))
}

fn stop() -> anyhow::Result<StreamFragment> {
    Ok(StreamFragment::Finished {
        reason: FinishReason::Stop,
        tool_calls: vec![],
    })
}

fn tool_calls(calls: &[(&str, &str, &str)]) -> anyhow::Result<StreamFragment> {
    Ok(StreamFragment::Finished {
        reason: FinishReason::ToolCalls,
        tool_calls: calls
            .iter()
            .map(|(id, name, args)| ToolCallRequest {
                id: id.to_string(),
                name: name.to_string(),
                arguments: ToolArguments::parse(args),
            })
            .collect(),
    })
}

fn orchestrator(model: Arc<ScriptedModel>, tools: Arc<FakeTools>) -> Orchestrator {
    Orchestrator::new(model, tools, ChatConfig::default())
}

fn roles(turns: &[Turn]) -> Vec<Role> {
    turns.iter().map(|t| t.role).collect()
}

#[tokio::test]
async fn plain_answer_finishes_without_tools() {
    let model = Arc::new(ScriptedModel::new(vec![Script::Fragments(vec![
        text("4"),
        stop(),
    ])]));
    let tools = Arc::new(FakeTools::new(vec![]));
    let orch = orchestrator(model.clone(), tools.clone());
    let sink = RecordingSink::default();

    let outcome = orch
        .handle(1, "What's 2+2?", &sink, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ExchangeOutcome::NoTool);
    assert_eq!(
        sink.events(),
        vec![
            StreamEvent::Delta("4".into()),
            StreamEvent::Done(DoneReason::NoTool)
        ]
    );
    let history = orch.sessions().history(1).await;
    assert_eq!(roles(&history), vec![Role::User, Role::Assistant]);
    assert_eq!(history[1].content, "4");
    assert!(tools.calls().is_empty());
}

#[tokio::test]
async fn tool_round_trip_produces_four_turns() {
    let model = Arc::new(ScriptedModel::new(vec![
        Script::Fragments(vec![tool_calls(&[(
            "call_1",
            "code_run",
            r#"{"command":"ls"}"#,
        )])]),
        Script::Fragments(vec![text("Here are the files."), stop()]),
    ]));
    let tools = Arc::new(FakeTools::new(vec![(
        "code_run",
        FakeResponse::Text("file1\nfile2".into()),
    )]));
    let orch = orchestrator(model.clone(), tools.clone());
    let sink = RecordingSink::default();

    let outcome = orch
        .handle(1, "run ls", &sink, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ExchangeOutcome::Completed);
    let events = sink.events();
    assert_eq!(
        sink.names(),
        vec!["tool_call_started", "tool_call", "tool_result", "delta", "done"]
    );
    assert_eq!(
        events[1],
        StreamEvent::ToolCall {
            name: "code_run".into(),
            args: ToolArguments::parse(r#"{"command":"ls"}"#)
        }
    );
    assert_eq!(
        events[2],
        StreamEvent::ToolResult {
            name: "code_run".into(),
            result: "file1\nfile2".into()
        }
    );
    assert_eq!(events[3], StreamEvent::Delta("Here are the files.".into()));
    assert_eq!(events[4], StreamEvent::Done(DoneReason::Completed));

    let history = orch.sessions().history(1).await;
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    assert_eq!(history[1].tool_calls[0].id, "call_1");
    assert_eq!(history[2].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(history[2].content, "file1\nfile2");
    assert_eq!(history[3].content, "Here are the files.");

    // the resumed stream sees the tool result and the same tool set
    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].1, 1);
    assert_eq!(requests[1].1, 1);
    let resumed = &requests[1].0;
    assert_eq!(resumed.len(), 3);
    assert_eq!(resumed[2].role, "tool");
    assert_eq!(resumed[2].tool_call_id.as_deref(), Some("call_1"));
}

#[tokio::test]
async fn tools_run_sequentially_in_model_order() {
    let model = Arc::new(ScriptedModel::new(vec![
        Script::Fragments(vec![
            text("Checking."),
            tool_calls(&[
                ("a", "fs_tree", "{}"),
                ("b", "fs_cat", r#"{"path":"x"}"#),
                ("c", "time_now", ""),
            ]),
        ]),
        Script::Fragments(vec![text("done"), stop()]),
    ]));
    let tools = Arc::new(FakeTools::new(vec![
        ("fs_tree", FakeResponse::Text("tree".into())),
        ("fs_cat", FakeResponse::Text("cat".into())),
        ("time_now", FakeResponse::Text("now".into())),
    ]));
    let orch = orchestrator(model, tools.clone());
    let sink = RecordingSink::default();

    orch.handle(3, "go", &sink, CancellationToken::new())
        .await
        .unwrap();

    let invoked: Vec<String> = tools.calls().into_iter().map(|(n, _)| n).collect();
    assert_eq!(invoked, vec!["fs_tree", "fs_cat", "time_now"]);

    let pairs: Vec<(String, &str)> = sink
        .events()
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ToolCall { name, .. } => Some((name.clone(), "call")),
            StreamEvent::ToolResult { name, .. } => Some((name.clone(), "result")),
            _ => None,
        })
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("fs_tree".to_string(), "call"),
            ("fs_tree".to_string(), "result"),
            ("fs_cat".to_string(), "call"),
            ("fs_cat".to_string(), "result"),
            ("time_now".to_string(), "call"),
            ("time_now".to_string(), "result"),
        ]
    );

    let history = orch.sessions().history(3).await;
    // text streamed before the tool request is kept on the assistant turn
    assert_eq!(history[1].content, "Checking.");
    let ids: Vec<&str> = history
        .iter()
        .filter_map(|t| t.tool_call_id.as_deref())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(history.len(), 6);
}

#[tokio::test]
async fn failed_tool_becomes_tool_error_text() {
    let model = Arc::new(ScriptedModel::new(vec![
        Script::Fragments(vec![tool_calls(&[("t1", "code_run", r#"{"command":"ls"}"#)])]),
        Script::Fragments(vec![text("The command timed out."), stop()]),
    ]));
    let tools = Arc::new(FakeTools::new(vec![(
        "code_run",
        FakeResponse::Fail(|name| ProviderError::ToolTimeout {
            name: name.to_string(),
            timeout: Duration::from_secs(30),
        }),
    )]));
    let orch = orchestrator(model, tools);
    let sink = RecordingSink::default();

    let outcome = orch
        .handle(1, "run ls", &sink, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ExchangeOutcome::Completed);
    let history = orch.sessions().history(1).await;
    assert_eq!(
        history[2].content,
        "tool error: tool code_run timed out after 30s"
    );
    assert_eq!(
        sink.events().last(),
        Some(&StreamEvent::Done(DoneReason::Completed))
    );
}

#[tokio::test]
async fn initial_stream_error_keeps_only_user_turn() {
    let model = Arc::new(ScriptedModel::new(vec![Script::Fragments(vec![
        text("partial "),
        Err(anyhow!("connection reset")),
    ])]));
    let orch = orchestrator(model, Arc::new(FakeTools::new(vec![])));
    let sink = RecordingSink::default();

    let err = orch
        .handle(1, "hello", &sink, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Stream(_)));
    assert!(err.to_string().contains("connection reset"));
    assert_eq!(sink.names(), vec!["delta"]);
    let history = orch.sessions().history(1).await;
    assert_eq!(history, vec![Turn::user("hello")]);
}

#[tokio::test]
async fn final_stream_error_keeps_tool_turns() {
    let model = Arc::new(ScriptedModel::new(vec![
        Script::Fragments(vec![tool_calls(&[("t1", "code_run", "{}")])]),
        Script::OpenError("backend unavailable".into()),
    ]));
    let tools = Arc::new(FakeTools::new(vec![(
        "code_run",
        FakeResponse::Text("ok".into()),
    )]));
    let orch = orchestrator(model, tools);
    let sink = RecordingSink::default();

    let err = orch
        .handle(1, "run", &sink, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::Stream(_)));
    assert!(!sink.names().contains(&"done"));
    let history = orch.sessions().history(1).await;
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::Tool]
    );
}

#[tokio::test]
async fn cancellation_during_tools_records_remaining_calls() {
    let cancel = CancellationToken::new();
    let model = Arc::new(ScriptedModel::new(vec![Script::Fragments(vec![tool_calls(&[
        ("a", "hang", "{}"),
        ("b", "code_run", "{}"),
    ])])]));
    let tools = Arc::new(FakeTools::new(vec![
        ("hang", FakeResponse::CancelAndHang(cancel.clone())),
        ("code_run", FakeResponse::Text("never".into())),
    ]));
    let orch = orchestrator(model, tools.clone());
    let sink = RecordingSink::default();

    let err = orch.handle(1, "go", &sink, cancel).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::Cancelled));
    assert_eq!(sink.names(), vec!["tool_call_started", "tool_call"]);
    assert_eq!(tools.calls().len(), 1);
    let history = orch.sessions().history(1).await;
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Tool]
    );
    assert!(history[2..].iter().all(|t| t.content == "tool error: cancelled"));
    assert_eq!(history[3].tool_call_id.as_deref(), Some("b"));
}

#[tokio::test]
async fn cancelled_model_stream_is_reported_as_cancel() {
    let model = Arc::new(ScriptedModel::new(vec![Script::Fragments(vec![Err(
        anyhow!(crate::llm::LlmErrorKind::Cancelled),
    )])]));
    let orch = orchestrator(model, Arc::new(FakeTools::new(vec![])));
    let err = orch
        .handle(1, "hi", &RecordingSink::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled));
}

#[tokio::test]
async fn sink_failures_do_not_abort() {
    let model = Arc::new(ScriptedModel::new(vec![Script::Fragments(vec![
        text("fine"),
        stop(),
    ])]));
    let orch = orchestrator(model, Arc::new(FakeTools::new(vec![])));
    let outcome = orch
        .handle(1, "hi", &BrokenSink, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ExchangeOutcome::NoTool);
    assert_eq!(orch.sessions().history(1).await.len(), 2);
}

#[tokio::test]
async fn second_round_tool_calls_are_ignored() {
    let model = Arc::new(ScriptedModel::new(vec![
        Script::Fragments(vec![tool_calls(&[("a", "code_run", "{}")])]),
        Script::Fragments(vec![
            text("one more"),
            tool_calls(&[("z", "code_run", "{}")]),
        ]),
    ]));
    let tools = Arc::new(FakeTools::new(vec![(
        "code_run",
        FakeResponse::Text("ok".into()),
    )]));
    let orch = orchestrator(model, tools.clone());
    let sink = RecordingSink::default();

    let outcome = orch
        .handle(1, "go", &sink, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, ExchangeOutcome::Completed);
    assert_eq!(tools.calls().len(), 1);
    let history = orch.sessions().history(1).await;
    assert_eq!(history.len(), 4);
    assert!(history[3].tool_calls.is_empty());
    assert_eq!(history[3].content, "one more");
}

#[tokio::test]
async fn empty_tool_call_list_is_plain_finish() {
    let model = Arc::new(ScriptedModel::new(vec![Script::Fragments(vec![
        text("hmm"),
        tool_calls(&[]),
    ])]));
    let orch = orchestrator(model, Arc::new(FakeTools::new(vec![])));
    let sink = RecordingSink::default();
    let outcome = orch
        .handle(1, "?", &sink, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, ExchangeOutcome::NoTool);
    assert_eq!(sink.names(), vec!["delta", "done"]);
}

#[tokio::test]
async fn empty_fragments_and_missing_finish() {
    let model = Arc::new(ScriptedModel::new(vec![Script::Fragments(vec![
        text(""),
        text("a"),
        text(""),
        text("b"),
    ])]));
    let orch = orchestrator(model, Arc::new(FakeTools::new(vec![])));
    let sink = RecordingSink::default();
    orch.handle(1, "?", &sink, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(sink.names(), vec!["delta", "delta", "done"]);
    assert_eq!(orch.sessions().history(1).await[1].content, "ab");
}

#[tokio::test]
async fn system_prompt_sent_but_not_stored_and_history_toggle() {
    let model = Arc::new(ScriptedModel::new(vec![
        Script::Fragments(vec![text("one"), stop()]),
        Script::Fragments(vec![text("two"), stop()]),
    ]));
    let chat = ChatConfig {
        system_prompt: Some("You are terse.".into()),
        history: false,
        max_turns: 0,
    };
    let orch = Orchestrator::new(model.clone(), Arc::new(FakeTools::new(vec![])), chat);
    let sink = RecordingSink::default();

    orch.handle(9, "first", &sink, CancellationToken::new())
        .await
        .unwrap();
    orch.handle(9, "second", &sink, CancellationToken::new())
        .await
        .unwrap();

    let requests = model.requests();
    assert_eq!(requests[0].0[0], ChatMessage::system("You are terse."));
    // history disabled: the second request starts fresh
    assert_eq!(requests[1].0.len(), 2);
    assert_eq!(requests[1].0[1], ChatMessage::user("second"));
    let history = orch.sessions().history(9).await;
    assert_eq!(history, vec![Turn::user("second"), Turn::assistant("two", vec![])]);
}

#[tokio::test]
async fn max_turns_trims_after_commit() {
    let model = Arc::new(ScriptedModel::new(vec![
        Script::Fragments(vec![text("a1"), stop()]),
        Script::Fragments(vec![text("a2"), stop()]),
        Script::Fragments(vec![text("a3"), stop()]),
    ]));
    let chat = ChatConfig {
        max_turns: 4,
        ..ChatConfig::default()
    };
    let orch = Orchestrator::new(model, Arc::new(FakeTools::new(vec![])), chat);
    let sink = RecordingSink::default();
    for q in ["q1", "q2", "q3"] {
        orch.handle(1, q, &sink, CancellationToken::new())
            .await
            .unwrap();
    }
    let history = orch.sessions().history(1).await;
    assert_eq!(history.len(), 4);
    assert_eq!(history[0], Turn::user("q2"));
}

#[tokio::test]
async fn same_session_exchanges_are_serialized() {
    let model = Arc::new(ScriptedModel {
        delay: Some(Duration::from_millis(20)),
        ..ScriptedModel::new(vec![
            Script::Fragments(vec![text("r1"), stop()]),
            Script::Fragments(vec![text("r2"), stop()]),
        ])
    });
    let orch = orchestrator(model, Arc::new(FakeTools::new(vec![])));
    let (s1, s2) = (RecordingSink::default(), RecordingSink::default());

    let (a, b) = tokio::join!(
        orch.handle(5, "m1", &s1, CancellationToken::new()),
        orch.handle(5, "m2", &s2, CancellationToken::new()),
    );
    a.unwrap();
    b.unwrap();

    let history = orch.sessions().history(5).await;
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
}

#[tokio::test]
async fn sessions_are_independent() {
    let model = Arc::new(ScriptedModel::new(vec![
        Script::Fragments(vec![text("x"), stop()]),
        Script::Fragments(vec![text("y"), stop()]),
    ]));
    let orch = orchestrator(model, Arc::new(FakeTools::new(vec![])));
    let sink = RecordingSink::default();
    orch.handle(1, "a", &sink, CancellationToken::new())
        .await
        .unwrap();
    orch.handle(2, "b", &sink, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(orch.sessions().history(1).await.len(), 2);
    assert_eq!(orch.sessions().history(2).await[0], Turn::user("b"));
    assert_eq!(orch.sessions().len().await, 2);
}
