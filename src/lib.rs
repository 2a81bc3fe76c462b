// arturo: Industrial test-automation suite.
//
// A central controller orchestrates lab instruments attached to
// microcontroller stations over a Redis backbone.  Test procedures are
// written in the embedded `.art` language.
//
// The root package exists for the cross-service integration suites under
// `tests/integration/`; the functional code lives in the workspace crates:
//
// - `art-protocol` — message envelope and payload types
// - `art-bus`      — pub/sub + stream transport (Redis client)
// - `art-script`   — the `.art` lexer, parser, and interpreter
// - `pump-sim`     — deterministic cryopump simulator
// - `controller`   — registry, station tracker, dispatcher, script runner
// - `station`      — simulated station service

pub use art_protocol as protocol;
