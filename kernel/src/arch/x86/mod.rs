//! 32-bit x86 support: port I/O, CPU flags, descriptor tables, the PIC/PIT
//! pair, and the context-switch primitive.

pub mod context;
pub mod cpu;
pub mod frame;
pub mod idt;
pub mod pic;
pub mod pit;
pub mod port;
