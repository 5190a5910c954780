// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types that describe what the system works with:
// images, labels and predictions. Loaders, models and the
// HTTP server all speak these types.
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O or network calls
//   - Only plain Rust structs, enums, and traits
//
// Reference: Rust Book §5 (Structs), §10 (Traits)

// Decoded images and labelled samples
pub mod image;

// Predicted class plus per-class probabilities
pub mod prediction;

// Core abstractions (traits) that other layers implement
pub mod traits;
