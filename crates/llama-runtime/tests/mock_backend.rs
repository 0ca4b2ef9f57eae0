//! Integration tests for the scripted backend.

use llama_engine::{
    Batch, ChatTurn, ContextParams, EngineBackend, EngineError, LlamaEngine, ModelSpec, Pos,
};
use llama_runtime::{MockBackend, MockEngine, DEFAULT_REPLY};

fn spec() -> ModelSpec {
    ModelSpec {
        path: "scripted".to_string(),
    }
}

fn decode_prompt(engine: &mut dyn LlamaEngine, text: &str) {
    let tokens = engine.tokenize(text, true, true).unwrap();
    let start = engine.used_cells();
    let mut batch = Batch::new(tokens.len(), 1);
    for (i, &t) in tokens.iter().enumerate() {
        batch.add(t, (start + i) as Pos, &[0], false).unwrap();
    }
    batch.request_last_logits().unwrap();
    engine.decode(&batch).unwrap();
}

fn generate(engine: &mut dyn LlamaEngine) -> String {
    let mut bytes = Vec::new();
    loop {
        let token = engine.sample().unwrap();
        if engine.is_end_of_generation(token) {
            break;
        }
        bytes.extend(engine.detokenize(token).unwrap());
        let mut step = Batch::new(1, 1);
        step.add(token, engine.used_cells() as Pos, &[0], true).unwrap();
        engine.decode(&step).unwrap();
    }
    String::from_utf8(bytes).unwrap()
}

#[test]
fn default_backend_replies_with_greeting() {
    let backend = MockBackend::default();
    let model = backend.load_model(&spec()).unwrap();
    let mut engine = backend.create_context(&model, &ContextParams::new(256)).unwrap();
    assert_eq!(engine.capacity(), 256);

    decode_prompt(&mut engine, "<|im_start|>user\nhi<|im_end|>\n");
    assert_eq!(generate(&mut engine), DEFAULT_REPLY);
}

#[test]
fn contexts_share_script_but_not_state() {
    let backend = MockBackend::with_replies(["one", "two"]);
    let model = backend.load_model(&spec()).unwrap();
    let mut a = backend.create_context(&model, &ContextParams::new(64)).unwrap();
    let mut b = backend.create_context(&model, &ContextParams::new(64)).unwrap();

    decode_prompt(&mut a, "x");
    decode_prompt(&mut a, "y");
    decode_prompt(&mut b, "z");
    assert_eq!(generate(&mut a), "two");
    assert_eq!(generate(&mut b), "one");
    assert_eq!(b.used_cells(), 2 + 3);
}

#[test]
fn empty_script_falls_back_to_default() {
    let backend = MockBackend::with_replies(Vec::<String>::new());
    let model = backend.load_model(&spec()).unwrap();
    let mut engine = backend.create_context(&model, &ContextParams::new(64)).unwrap();
    decode_prompt(&mut engine, "q");
    assert_eq!(generate(&mut engine), DEFAULT_REPLY);
}

#[test]
fn backend_rejects_bad_inputs() {
    let backend = MockBackend::new();
    let err = backend
        .load_model(&ModelSpec {
            path: String::new(),
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::ModelLoad(_)));

    let model = backend.load_model(&spec()).unwrap();
    let err = backend
        .create_context(&model, &ContextParams::new(0))
        .unwrap_err();
    assert!(matches!(err, EngineError::Context(_)));
}

#[test]
fn boxed_engine_is_usable_through_the_trait() {
    let mut engine: Box<dyn LlamaEngine> = Box::new(MockEngine::new(64).with_replies(["ok"]));
    decode_prompt(engine.as_mut(), "hello");
    assert_eq!(generate(engine.as_mut()), "ok");

    let mut buf = vec![0u8; 4];
    let needed = engine.apply_chat_template(&[ChatTurn::user("hi")], false, &mut buf);
    assert_eq!(needed as usize, "<|im_start|>user\nhi<|im_end|>\n".len());
}
