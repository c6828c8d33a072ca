// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec-specific bitstream helpers. These are pure functions and carry no decoder state.

pub mod vp9;
