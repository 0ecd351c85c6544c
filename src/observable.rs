// Copyright 2024 The Keysafe Contributors
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

use std::sync::{Arc, RwLock};

use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

/// An observable value that remembers its latest state.
///
/// New subscribers immediately receive the current value, followed by every
/// subsequent update. Slow subscribers that miss updates receive a
/// [`BroadcastStreamRecvError::Lagged`] instead of blocking the sender.
#[derive(Clone, Debug)]
pub(crate) struct ChannelObservable<T: Clone + Send> {
    value: Arc<RwLock<T>>,
    channel: broadcast::Sender<T>,
}

impl<T: 'static + Send + Sync + Clone> ChannelObservable<T> {
    pub(crate) fn new(value: T) -> Self {
        let (channel, _) = broadcast::channel(100);

        Self { value: RwLock::new(value).into(), channel }
    }

    pub(crate) fn subscribe(
        &self,
    ) -> impl Stream<Item = Result<T, BroadcastStreamRecvError>> {
        let current_value = self.value.read().unwrap().to_owned();
        let initial_stream = tokio_stream::once(Ok(current_value));
        let broadcast_stream = BroadcastStream::new(self.channel.subscribe());

        initial_stream.chain(broadcast_stream)
    }

    pub(crate) fn set(&self, new_value: T) -> T {
        let old_value = {
            let mut guard = self.value.write().unwrap();
            std::mem::replace(&mut *guard, new_value.clone())
        };

        // A send error just means there are no subscribers right now.
        let _ = self.channel.send(new_value);

        old_value
    }

    pub(crate) fn get(&self) -> T {
        self.value.read().unwrap().to_owned()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::ChannelObservable;

    #[tokio::test]
    async fn subscribers_receive_the_current_value_first() {
        let observable = ChannelObservable::new(0u64);
        observable.set(1);

        let mut stream = observable.subscribe();
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);

        observable.set(2);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
        assert_eq!(observable.get(), 2);
    }
}
