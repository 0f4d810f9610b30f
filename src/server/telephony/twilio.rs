//! Twilio REST API client.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{
    CallResult, CallStatus, Conference, TelephonyError, TelephonyPort,
};

#[derive(Clone)]
pub struct TwilioClient {
    client: Client,
    account_sid: String,
    auth_token: String,
    app_sid: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct CallResource {
    sid: String,
    status: String,
}

impl TwilioClient {
    pub fn new(account_sid: String, auth_token: String, app_sid: String) -> Self {
        Self {
            client: Client::new(),
            account_sid,
            auth_token,
            app_sid,
            base_url: "https://api.twilio.com/2010-04-01".to_string(),
        }
    }

    fn calls_url(&self) -> String {
        format!("{}/Accounts/{}/Calls.json", self.base_url, self.account_sid)
    }

    fn call_url(&self, call_sid: &str) -> String {
        format!(
            "{}/Accounts/{}/Calls/{}.json",
            self.base_url, self.account_sid, call_sid
        )
    }

    async fn post_form(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<CallResource, TelephonyError> {
        let response = self
            .client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(params)
            .send()
            .await?;

        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TelephonyError::Api { message });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl TelephonyPort for TwilioClient {
    async fn make_call(
        &self,
        to: &str,
        from: &str,
        status_callback_url: Option<&str>,
        machine_detection: bool,
    ) -> Result<CallResult, TelephonyError> {
        let mut params: Vec<(&str, &str)> = vec![("To", to), ("From", from)];

        if !self.app_sid.is_empty() {
            params.push(("ApplicationSid", &self.app_sid));
        } else {
            params.push(("Url", "http://demo.twilio.com/docs/voice.xml"));
        }

        let amd_callback;
        if let Some(callback) = status_callback_url {
            params.push(("StatusCallback", callback));
            params.push(("StatusCallbackEvent", "initiated ringing answered completed"));

            if machine_detection {
                params.push(("MachineDetection", "DetectMessageEnd"));
                params.push(("AsyncAmd", "true"));
                amd_callback = callback.replace("/status", "/amd");
                params.push(("AsyncAmdStatusCallback", &amd_callback));
            }
        } else if machine_detection {
            params.push(("MachineDetection", "DetectMessageEnd"));
        }

        let resource = self.post_form(&self.calls_url(), &params).await?;
        let status = CallStatus::parse(&resource.status).unwrap_or(CallStatus::Queued);

        Ok(CallResult {
            call_sid: resource.sid,
            status,
            to: to.to_string(),
            from: from.to_string(),
        })
    }

    async fn create_conference(&self, friendly_name: &str) -> Result<Conference, TelephonyError> {
        // Twilio creates conferences implicitly when the first participant
        // joins, so this only reserves the room name.
        Ok(Conference {
            sid: format!("CF-{friendly_name}"),
            friendly_name: friendly_name.to_string(),
            status: "init".to_string(),
        })
    }

    async fn add_participant_to_conference(
        &self,
        conference_sid: &str,
        call_sid: &str,
        muted: bool,
        _hold: bool,
    ) -> Result<(), TelephonyError> {
        // Redirect the live call leg into the named conference room.
        let room = conference_sid.trim_start_matches("CF-");
        let twiml = format!(
            r#"<Response><Dial><Conference muted="{muted}" beep="false" startConferenceOnEnter="true" endConferenceOnExit="true">{room}</Conference></Dial></Response>"#
        );

        self.post_form(&self.call_url(call_sid), &[("Twiml", &twiml)])
            .await?;
        Ok(())
    }

    async fn hangup_call(&self, call_sid: &str) -> Result<(), TelephonyError> {
        self.post_form(&self.call_url(call_sid), &[("Status", "completed")])
            .await?;
        Ok(())
    }

    async fn get_call_status(&self, call_sid: &str) -> Result<CallStatus, TelephonyError> {
        let response = self
            .client
            .get(self.call_url(call_sid))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(TelephonyError::CallNotFound(call_sid.to_string()));
        }
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TelephonyError::Api { message });
        }

        let resource: CallResource = response.json().await?;
        CallStatus::parse(&resource.status).ok_or(TelephonyError::Api {
            message: format!("unknown call status: {}", resource.status),
        })
    }
}
