// Copyright 2025 jonefeewang@gmail.com
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

use tokio_util::sync::CancellationToken;

/// Close signal for a listener or a connection.
///
/// Triggering it is how a socket gets "closed" from another thread: the loop
/// blocked on that socket wakes up, stops, and drops it. Signals derived with
/// [`Shutdown::child`] fire when their parent does.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    notify: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown {
            notify: CancellationToken::new(),
        }
    }

    pub fn child(&self) -> Shutdown {
        Shutdown {
            notify: self.notify.child_token(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.notify.is_cancelled()
    }

    pub fn trigger(&self) {
        self.notify.cancel();
    }

    pub async fn recv(&self) {
        self.notify.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::runtime;

    #[test]
    fn parent_reaches_children() {
        let parent = Shutdown::new();
        let child = parent.child();
        let other = parent.child();

        other.trigger();
        assert!(other.is_shutdown());
        assert!(!parent.is_shutdown());
        assert!(!child.is_shutdown());

        parent.trigger();
        assert!(child.is_shutdown());

        let rt = runtime::io_runtime().unwrap();
        runtime::block_on(rt, child.recv());
    }
}
