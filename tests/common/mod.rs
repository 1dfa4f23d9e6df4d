// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

pub mod broker;
pub mod fakes;

pub use broker::*;
pub use fakes::*;
