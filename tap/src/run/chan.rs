use crate::warn;
use color_eyre::eyre::{eyre, Report};
use tokio::sync::mpsc;

/// Creates a named, bounded channel pair.
pub fn channel<M>(
    buffer: usize,
) -> (ChannelSender<M>, ChannelReceiver<M>) {
    let (sender, receiver) = mpsc::channel(buffer);
    (
        ChannelSender { name: None, sender },
        ChannelReceiver { receiver },
    )
}

/// A bounded sender that knows its name, so send failures identify the
/// channel in the logs.
#[derive(Debug)]
pub struct ChannelSender<M> {
    name: Option<String>,
    sender: mpsc::Sender<M>,
}

#[derive(Debug)]
pub struct ChannelReceiver<M> {
    receiver: mpsc::Receiver<M>,
}

impl<M> Clone for ChannelSender<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
        }
    }
}

impl<M> ChannelSender<M> {
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub async fn send(&self, value: M) -> Result<(), Report> {
        self.sender.send(value).await.map_err(|_| {
            let name = self.name.as_deref().unwrap_or("unnamed");
            warn!("[chan] {} receiver is gone", name);
            eyre!("channel {} closed", name)
        })
    }
}

impl<M> ChannelReceiver<M> {
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }
}
