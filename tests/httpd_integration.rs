// HTTP daemon integration: index placeholders, directory serving, command
// form, Twilio hooks, self test and the global rate limit.

use outpost::feature::{FeatureSet, FeaturesConfig};
use outpost::httpd::{HttpDaemon, HttpDaemonConfig, HttpHandlersConfig};
use outpost::mailer::Mailer;
use outpost::pipeline::{CommandPipeline, PipelineConfig};
use outpost::ringlog::{DaemonLogger, LogBuffers};
use outpost::supervisor::SharedState;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn test_pipeline() -> Arc<CommandPipeline> {
    let config: PipelineConfig = serde_json::from_value(json!({
        "PINAndShortcuts": {
            "PIN": "httpsecret",
            "Shortcuts": {"httpshortcut": ".s echo httpshortcut"}
        },
        "LintText": {
            "TrimSpaces": true,
            "CompressToSingleLine": true,
            "KeepVisible7BitCharOnly": true,
            "CompressSpaces": true,
            "MaxLength": 35
        }
    }))
    .expect("pipeline config");
    let features = test_features();
    let logger = DaemonLogger::new("PIPELINE", "httpd", LogBuffers::new());
    Arc::new(CommandPipeline::new(config, features, Mailer::default(), logger).expect("pipeline"))
}

fn test_features() -> Arc<FeatureSet> {
    let config: FeaturesConfig =
        serde_json::from_value(json!({"Shell": {"InterpreterPath": "/bin/sh"}}))
            .expect("features config");
    Arc::new(FeatureSet::from_config(&config, Mailer::default()).expect("feature set"))
}

struct TestServer {
    base_url: String,
    callback_path: String,
    _serve_dir: tempfile::TempDir,
}

async fn start_daemon(listen_port: u16, base_rate_limit: u32) -> TestServer {
    let serve_dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(serve_dir.path().join("a.html"), "a html").expect("write file");
    let index_path = serve_dir.path().join("index.html");
    std::fs::write(
        &index_path,
        "this is index #LAITOS_CLIENTADDR #LAITOS_3339TIME",
    )
    .expect("write index");

    let handlers: HttpHandlersConfig = serde_json::from_value(json!({
        "IndexEndpoints": ["/", "/index.html"],
        "IndexEndpointConfig": {"HTMLFilePath": index_path.to_string_lossy()},
        "CommandFormEndpoint": "/cmd_form",
        "WebProxyEndpoint": "/proxy",
        "SelfTestEndpoint": "/test",
        "InformationEndpoint": "/info",
        "TwilioSMSEndpoint": "/sms",
        "TwilioCallEndpoint": "/call",
        "TwilioCallEndpointConfig": {"CallGreeting": "Hi there"}
    }))
    .expect("handlers config");
    let daemon = HttpDaemon::new(
        HttpDaemonConfig {
            listen_address: "127.0.0.1".to_string(),
            listen_port,
            base_rate_limit,
            serve_directories: HashMap::from([(
                "/my/dir".to_string(),
                serve_dir.path().to_string_lossy().into_owned(),
            )]),
        },
        handlers,
        Some(test_pipeline()),
        test_features(),
        Mailer::default(),
        SharedState::new(LogBuffers::new()),
    )
    .expect("daemon");
    let callback_path = daemon.twilio_callback_path().to_string();
    tokio::spawn(async move {
        let _ = daemon.start_and_block().await;
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    TestServer {
        base_url: format!("http://127.0.0.1:{}", listen_port),
        callback_path,
        _serve_dir: serve_dir,
    }
}

#[tokio::test]
async fn test_built_in_endpoints() {
    let server = start_daemon(23486, 1000).await;
    let client = reqwest::Client::new();

    // Index with placeholder substitution, on both paths
    for location in ["/", "/index.html"] {
        let response = client
            .get(format!("{}{}", server.base_url, location))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status().as_u16(), 200);
        let body = response.text().await.expect("body");
        assert!(body.starts_with("this is index 127.0.0.1 "), "{}", body);
        assert!(body.contains('T'), "no RFC3339 time in {}", body);
    }

    // Directory listing and file serving
    let body = client
        .get(format!("{}/my/dir", server.base_url))
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert!(body.contains("<a href=\"a.html\">a.html</a>"), "{}", body);
    let response = client
        .get(format!("{}/my/dir/a.html", server.base_url))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.expect("body"), "a html");

    // Non-existent paths
    for location in ["/my/dir/doesnotexist.html", "/doesnotexist"] {
        let response = client
            .get(format!("{}{}", server.base_url, location))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status().as_u16(), 404, "{}", location);
    }

    // Feature self test
    let response = client
        .get(format!("{}/test", server.base_url))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 200);

    // Runtime information
    let body = client
        .get(format!("{}/info", server.base_url))
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert!(body.contains("Clock:"), "{}", body);
    assert!(body.contains("CPUs:"), "{}", body);

    // Command form
    let body = client
        .get(format!("{}/cmd_form", server.base_url))
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert!(body.contains("submit"), "{}", body);
    let body = client
        .post(format!("{}/cmd_form", server.base_url))
        .form(&[("cmd", "httpsecret.sls /")])
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert!(body.contains("bin"), "{}", body);

    // Web proxy fetching our own index page
    let response = client
        .get(format!("{}/proxy", server.base_url))
        .query(&[("u", format!("{}/", server.base_url))])
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.expect("body");
    assert!(body.starts_with("this is index"), "{}", body);
}

#[tokio::test]
async fn test_twilio_hooks() {
    let server = start_daemon(23487, 1000).await;
    let client = reqwest::Client::new();

    // PIN mismatch answers 404
    let response = client
        .post(format!("{}/sms", server.base_url))
        .form(&[("Body", "pin mismatch")])
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 404);

    // Spaces around the PIN do not matter; output truncated by LintText
    let response = client
        .post(format!("{}/sms", server.base_url))
        .form(&[(
            "Body",
            "httpsecret .s echo 0123456789012345678901234567890123456789",
        )])
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response.text().await.expect("body"),
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response><Message>01234567890123456789012345678901234</Message></Response>\n"
    );

    // Call greeting points the gather at the random callback path
    let body = client
        .get(format!("{}/call", server.base_url))
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    let expected = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <Response>\n\
         \x20   <Gather action=\"{}\" method=\"POST\" timeout=\"30\" finishOnKey=\"#\" numDigits=\"1000\">\n\
         \x20       <Say>Hi there</Say>\n\
         \x20   </Gather>\n\
         </Response>\n",
        server.callback_path
    );
    assert_eq!(body, expected);

    // Undecodable digits are answered with an apology
    let body = client
        .post(format!("{}{}", server.base_url, server.callback_path))
        .form(&[("Digits", "0000000")])
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert_eq!(
        body,
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Response>\n\t<Say>Sorry</Say>\n\t<Hangup/>\n</Response>\n"
    );

    // httpsecret.s true, spelled out on the number pad; true prints nothing
    let body = client
        .post(format!("{}{}", server.base_url, server.callback_path))
        .form(&[("Digits", "4408080707777033022207770330801077770080777088033")])
        .send()
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert!(
        body.contains("EMPTY OUTPUT, repeat again, EMPTY OUTPUT, repeat again, EMPTY OUTPUT, over."),
        "{}",
        body
    );
}

#[tokio::test]
async fn test_rate_limit_answers_429() {
    let server = start_daemon(23488, 1).await;
    let client = reqwest::Client::new();
    let mut ok = 0;
    let mut limited = 0;
    for _ in 0..5 {
        let status = client
            .get(format!("{}/info", server.base_url))
            .send()
            .await
            .expect("request")
            .status()
            .as_u16();
        match status {
            200 => ok += 1,
            429 => limited += 1,
            other => panic!("unexpected status {}", other),
        }
    }
    assert!(ok >= 1, "no request admitted");
    assert!(limited >= 1, "no request limited");
}
