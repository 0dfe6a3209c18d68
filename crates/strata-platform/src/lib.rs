// SPDX-License-Identifier: CEPL-1.0
//! Windowing lives behind this crate so the app never names `winit` directly.
pub use winit;
