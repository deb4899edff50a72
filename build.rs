// Copyright 2026 The prismvnc Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;
use std::path::PathBuf;

fn main() {
    // Linker configuration is only needed for the turbojpeg feature.
    if env::var("CARGO_FEATURE_TURBOJPEG").is_err() {
        return;
    }

    // On macOS, libjpeg-turbo is typically installed via Homebrew, outside
    // the default linker search path.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        let homebrew_paths = [
            "/opt/homebrew/opt/jpeg-turbo/lib", // Apple Silicon
            "/usr/local/opt/jpeg-turbo/lib",    // Intel
        ];

        for path in homebrew_paths {
            if PathBuf::from(path).exists() {
                println!("cargo:rustc-link-search=native={path}");
                println!("cargo:rustc-link-lib=turbojpeg");
                return;
            }
        }

        // Fall through and hope the library is in the system path.
        println!("cargo:rustc-link-lib=turbojpeg");
    }
}
