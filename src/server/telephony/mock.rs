//! Mock telephony provider for development and testing.
//!
//! Simulates call progression (queued -> ringing -> in-progress -> AMD)
//! on timers and pushes [`TelephonyEvent`]s into a channel, standing in
//! for the webhook callbacks a real provider would deliver.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    AmdResult, CallResult, CallStatus, Conference, TelephonyError, TelephonyEvent, TelephonyPort,
};

#[derive(Debug, Clone)]
pub struct MockCall {
    pub call_sid: String,
    pub to: String,
    pub from: String,
    pub status: CallStatus,
    pub amd_result: Option<AmdResult>,
    pub conference_sid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MockConference {
    pub sid: String,
    pub friendly_name: String,
    pub status: String,
    pub participants: Vec<String>,
}

pub struct MockTelephony {
    default_amd_result: AmdResult,
    ring_delay: Duration,
    call_answer_delay: Duration,
    amd_detection_delay: Duration,

    calls: Arc<Mutex<HashMap<String, MockCall>>>,
    conferences: Arc<Mutex<HashMap<String, MockConference>>>,
    forced_amd: Arc<Mutex<VecDeque<AmdResult>>>,
    events: mpsc::UnboundedSender<TelephonyEvent>,
}

fn generate_sid(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

impl MockTelephony {
    /// Create a mock with production-like pacing. Returns the port and
    /// the event stream the dialer engine consumes.
    pub fn new(default_amd_result: AmdResult) -> (Arc<Self>, mpsc::UnboundedReceiver<TelephonyEvent>) {
        Self::with_delays(
            default_amd_result,
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(2),
        )
    }

    /// Create a mock with explicit delays (zero for deterministic tests).
    pub fn with_delays(
        default_amd_result: AmdResult,
        ring_delay: Duration,
        call_answer_delay: Duration,
        amd_detection_delay: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TelephonyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mock = Arc::new(Self {
            default_amd_result,
            ring_delay,
            call_answer_delay,
            amd_detection_delay,
            calls: Arc::new(Mutex::new(HashMap::new())),
            conferences: Arc::new(Mutex::new(HashMap::new())),
            forced_amd: Arc::new(Mutex::new(VecDeque::new())),
            events: tx,
        });
        (mock, rx)
    }

    /// Force the AMD result of the next call (FIFO when queued repeatedly).
    pub fn set_next_amd_result(&self, result: AmdResult) {
        self.forced_amd.lock().unwrap().push_back(result);
    }

    pub fn get_call(&self, call_sid: &str) -> Option<MockCall> {
        self.calls.lock().unwrap().get(call_sid).cloned()
    }

    pub fn call_sids(&self) -> Vec<String> {
        self.calls.lock().unwrap().keys().cloned().collect()
    }

    pub fn get_conference(&self, conference_sid: &str) -> Option<MockConference> {
        self.conferences.lock().unwrap().get(conference_sid).cloned()
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
        self.conferences.lock().unwrap().clear();
        self.forced_amd.lock().unwrap().clear();
    }

    fn set_status(
        calls: &Mutex<HashMap<String, MockCall>>,
        events: &mpsc::UnboundedSender<TelephonyEvent>,
        call_sid: &str,
        status: CallStatus,
    ) -> bool {
        {
            let mut calls = calls.lock().unwrap();
            match calls.get_mut(call_sid) {
                // A hung-up call stops progressing
                Some(call) if call.status != CallStatus::Completed => call.status = status,
                _ => return false,
            }
        }
        let _ = events.send(TelephonyEvent::StatusChanged {
            call_sid: call_sid.to_string(),
            status,
        });
        true
    }
}

#[async_trait]
impl TelephonyPort for MockTelephony {
    async fn make_call(
        &self,
        to: &str,
        from: &str,
        _status_callback_url: Option<&str>,
        machine_detection: bool,
    ) -> Result<CallResult, TelephonyError> {
        let call_sid = generate_sid("CA");

        let amd_result = self
            .forced_amd
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_amd_result);

        self.calls.lock().unwrap().insert(
            call_sid.clone(),
            MockCall {
                call_sid: call_sid.clone(),
                to: to.to_string(),
                from: from.to_string(),
                status: CallStatus::Queued,
                amd_result: None,
                conference_sid: None,
            },
        );

        // Simulated call progression
        let calls = self.calls.clone();
        let events = self.events.clone();
        let sid = call_sid.clone();
        let (ring_delay, answer_delay, amd_delay) = (
            self.ring_delay,
            self.call_answer_delay,
            self.amd_detection_delay,
        );
        tokio::spawn(async move {
            tokio::time::sleep(ring_delay).await;
            if !Self::set_status(&calls, &events, &sid, CallStatus::Ringing) {
                return;
            }

            tokio::time::sleep(answer_delay).await;
            if !Self::set_status(&calls, &events, &sid, CallStatus::InProgress) {
                return;
            }

            if machine_detection {
                tokio::time::sleep(amd_delay).await;
                {
                    let mut calls = calls.lock().unwrap();
                    match calls.get_mut(&sid) {
                        Some(call) if call.status == CallStatus::InProgress => {
                            call.amd_result = Some(amd_result);
                        }
                        _ => return,
                    }
                }
                let _ = events.send(TelephonyEvent::Amd {
                    call_sid: sid,
                    result: amd_result,
                });
            }
        });

        Ok(CallResult {
            call_sid,
            status: CallStatus::Queued,
            to: to.to_string(),
            from: from.to_string(),
        })
    }

    async fn create_conference(&self, friendly_name: &str) -> Result<Conference, TelephonyError> {
        let sid = generate_sid("CF");
        self.conferences.lock().unwrap().insert(
            sid.clone(),
            MockConference {
                sid: sid.clone(),
                friendly_name: friendly_name.to_string(),
                status: "init".to_string(),
                participants: Vec::new(),
            },
        );

        Ok(Conference {
            sid,
            friendly_name: friendly_name.to_string(),
            status: "init".to_string(),
        })
    }

    async fn add_participant_to_conference(
        &self,
        conference_sid: &str,
        call_sid: &str,
        _muted: bool,
        _hold: bool,
    ) -> Result<(), TelephonyError> {
        {
            let calls = self.calls.lock().unwrap();
            if !calls.contains_key(call_sid) {
                return Err(TelephonyError::CallNotFound(call_sid.to_string()));
            }
        }

        let mut conferences = self.conferences.lock().unwrap();
        let conference = conferences
            .get_mut(conference_sid)
            .ok_or_else(|| TelephonyError::ConferenceNotFound(conference_sid.to_string()))?;

        conference.participants.push(call_sid.to_string());
        conference.status = "in-progress".to_string();

        if let Some(call) = self.calls.lock().unwrap().get_mut(call_sid) {
            call.conference_sid = Some(conference_sid.to_string());
        }
        Ok(())
    }

    async fn hangup_call(&self, call_sid: &str) -> Result<(), TelephonyError> {
        {
            let mut calls = self.calls.lock().unwrap();
            let call = calls
                .get_mut(call_sid)
                .ok_or_else(|| TelephonyError::CallNotFound(call_sid.to_string()))?;
            call.status = CallStatus::Completed;
        }
        let _ = self.events.send(TelephonyEvent::StatusChanged {
            call_sid: call_sid.to_string(),
            status: CallStatus::Completed,
        });
        Ok(())
    }

    async fn get_call_status(&self, call_sid: &str) -> Result<CallStatus, TelephonyError> {
        self.calls
            .lock()
            .unwrap()
            .get(call_sid)
            .map(|call| call.status)
            .ok_or_else(|| TelephonyError::CallNotFound(call_sid.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_mock(
        amd: AmdResult,
    ) -> (Arc<MockTelephony>, mpsc::UnboundedReceiver<TelephonyEvent>) {
        MockTelephony::with_delays(amd, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn call_progresses_to_amd() {
        let (mock, mut events) = instant_mock(AmdResult::Human);
        let result = mock
            .make_call("+818011112222", "+815011110000", None, true)
            .await
            .unwrap();
        assert_eq!(result.status, CallStatus::Queued);

        let mut statuses = Vec::new();
        let mut amd = None;
        while amd.is_none() {
            match events.recv().await.unwrap() {
                TelephonyEvent::StatusChanged { status, .. } => statuses.push(status),
                TelephonyEvent::Amd { result, .. } => amd = Some(result),
            }
        }

        assert_eq!(statuses, vec![CallStatus::Ringing, CallStatus::InProgress]);
        assert_eq!(amd, Some(AmdResult::Human));
        assert_eq!(
            mock.get_call(&result.call_sid).unwrap().amd_result,
            Some(AmdResult::Human)
        );
    }

    #[tokio::test]
    async fn no_amd_without_machine_detection() {
        let (mock, mut events) = instant_mock(AmdResult::Human);
        mock.make_call("+818011112222", "+815011110000", None, false)
            .await
            .unwrap();

        let mut saw_in_progress = false;
        while let Ok(event) =
            tokio::time::timeout(Duration::from_millis(50), events.recv()).await
        {
            match event.unwrap() {
                TelephonyEvent::StatusChanged {
                    status: CallStatus::InProgress,
                    ..
                } => saw_in_progress = true,
                TelephonyEvent::Amd { .. } => panic!("unexpected AMD event"),
                _ => {}
            }
        }
        assert!(saw_in_progress);
    }

    #[tokio::test]
    async fn forced_amd_applies_to_next_call_only() {
        let (mock, mut events) = instant_mock(AmdResult::Human);
        mock.set_next_amd_result(AmdResult::MachineEndBeep);

        mock.make_call("+818011112222", "+815011110000", None, true)
            .await
            .unwrap();

        let mut amd = None;
        while amd.is_none() {
            if let TelephonyEvent::Amd { result, .. } = events.recv().await.unwrap() {
                amd = Some(result);
            }
        }
        assert_eq!(amd, Some(AmdResult::MachineEndBeep));
    }

    #[tokio::test]
    async fn hangup_stops_progression() {
        let (mock, _events) = MockTelephony::with_delays(
            AmdResult::Human,
            Duration::from_millis(20),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        let result = mock
            .make_call("+818011112222", "+815011110000", None, true)
            .await
            .unwrap();

        mock.hangup_call(&result.call_sid).await.unwrap();
        assert_eq!(
            mock.get_call_status(&result.call_sid).await.unwrap(),
            CallStatus::Completed
        );

        // Progression timers fire but must not resurrect the call
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            mock.get_call_status(&result.call_sid).await.unwrap(),
            CallStatus::Completed
        );
        assert!(mock.get_call(&result.call_sid).unwrap().amd_result.is_none());
    }

    #[tokio::test]
    async fn conference_tracks_participants() {
        let (mock, _events) = instant_mock(AmdResult::Human);
        let call = mock
            .make_call("+818011112222", "+815011110000", None, false)
            .await
            .unwrap();

        let conference = mock.create_conference("room-test").await.unwrap();
        mock.add_participant_to_conference(&conference.sid, &call.call_sid, false, false)
            .await
            .unwrap();

        let stored = mock.get_conference(&conference.sid).unwrap();
        assert_eq!(stored.participants, vec![call.call_sid.clone()]);
        assert_eq!(stored.status, "in-progress");
        assert_eq!(
            mock.get_call(&call.call_sid).unwrap().conference_sid,
            Some(conference.sid.clone())
        );

        let err = mock
            .add_participant_to_conference("CFmissing", &call.call_sid, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TelephonyError::ConferenceNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_call_errors() {
        let (mock, _events) = instant_mock(AmdResult::Human);
        assert!(matches!(
            mock.get_call_status("CAmissing").await.unwrap_err(),
            TelephonyError::CallNotFound(_)
        ));
        assert!(matches!(
            mock.hangup_call("CAmissing").await.unwrap_err(),
            TelephonyError::CallNotFound(_)
        ));
    }
}
